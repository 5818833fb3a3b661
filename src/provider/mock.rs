//! Scripted provider and artifact store for tests.
//!
//! Both mocks count calls so tests can assert retry and idempotency
//! behavior precisely (e.g. "a 422 causes exactly one submit attempt").

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use super::{ArtifactStore, JobState, JobStatus, ProviderClient, ProviderError, SubmittedJob};

/// Scripted outcome for a submit call.
#[derive(Debug, Clone)]
pub enum SubmitScript {
    /// Succeed with a generated task id.
    Ok,
    /// Succeed with a specific task id.
    OkWithId(String),
    /// Fail with an HTTP status.
    Api(u16, String),
    /// Fail with a 429 and optional Retry-After seconds.
    RateLimited(Option<u64>),
    /// Fail with a timeout.
    Timeout,
}

/// Scripted outcome for a poll call.
#[derive(Debug, Clone)]
pub enum PollScript {
    Pending,
    Processing,
    Complete {
        artifact_url: String,
        duration_seconds: Option<f64>,
    },
    Failed(String),
    Timeout,
}

/// Scripted provider client.
///
/// Consumes scripted outcomes in order; once a script runs dry, submits
/// succeed with generated ids and polls report `processing`.
pub struct MockProviderClient {
    submit_script: Mutex<VecDeque<SubmitScript>>,
    poll_script: Mutex<VecDeque<PollScript>>,
    submit_calls: AtomicUsize,
    poll_calls: AtomicUsize,
    task_seq: AtomicUsize,
}

impl MockProviderClient {
    pub fn new() -> Self {
        Self {
            submit_script: Mutex::new(VecDeque::new()),
            poll_script: Mutex::new(VecDeque::new()),
            submit_calls: AtomicUsize::new(0),
            poll_calls: AtomicUsize::new(0),
            task_seq: AtomicUsize::new(0),
        }
    }

    /// Queue a submit outcome.
    pub fn script_submit(&self, outcome: SubmitScript) {
        self.submit_script.lock().unwrap().push_back(outcome);
    }

    /// Queue a poll outcome.
    pub fn script_poll(&self, outcome: PollScript) {
        self.poll_script.lock().unwrap().push_back(outcome);
    }

    /// Number of submit calls made so far.
    pub fn submit_calls(&self) -> usize {
        self.submit_calls.load(Ordering::SeqCst)
    }

    /// Number of poll calls made so far.
    pub fn poll_calls(&self) -> usize {
        self.poll_calls.load(Ordering::SeqCst)
    }

    fn next_task_id(&self) -> String {
        let n = self.task_seq.fetch_add(1, Ordering::SeqCst);
        format!("mock-task-{}", n)
    }
}

impl Default for MockProviderClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProviderClient for MockProviderClient {
    async fn submit(&self, _prompt: &str, _callback_url: &str) -> Result<SubmittedJob, ProviderError> {
        self.submit_calls.fetch_add(1, Ordering::SeqCst);

        let scripted = self.submit_script.lock().unwrap().pop_front();
        match scripted {
            None | Some(SubmitScript::Ok) => Ok(SubmittedJob {
                external_task_id: self.next_task_id(),
            }),
            Some(SubmitScript::OkWithId(id)) => Ok(SubmittedJob { external_task_id: id }),
            Some(SubmitScript::Api(status, message)) => Err(ProviderError::Api { status, message }),
            Some(SubmitScript::RateLimited(secs)) => Err(ProviderError::RateLimited {
                retry_after: secs.map(Duration::from_secs),
            }),
            Some(SubmitScript::Timeout) => Err(ProviderError::Timeout("mock timeout".to_string())),
        }
    }

    async fn poll(&self, external_task_id: &str) -> Result<JobStatus, ProviderError> {
        self.poll_calls.fetch_add(1, Ordering::SeqCst);

        let scripted = self.poll_script.lock().unwrap().pop_front();
        match scripted {
            None | Some(PollScript::Processing) => Ok(JobStatus {
                state: JobState::Processing,
                artifact_url: None,
                error_message: None,
                duration_seconds: None,
            }),
            Some(PollScript::Pending) => Ok(JobStatus {
                state: JobState::Pending,
                artifact_url: None,
                error_message: None,
                duration_seconds: None,
            }),
            Some(PollScript::Complete {
                artifact_url,
                duration_seconds,
            }) => Ok(JobStatus {
                state: JobState::Complete,
                artifact_url: Some(artifact_url),
                error_message: None,
                duration_seconds,
            }),
            Some(PollScript::Failed(message)) => Ok(JobStatus {
                state: JobState::Failed,
                artifact_url: None,
                error_message: Some(message),
                duration_seconds: None,
            }),
            Some(PollScript::Timeout) => Err(ProviderError::Timeout(format!(
                "mock poll timeout for {}",
                external_task_id
            ))),
        }
    }
}

/// Counting artifact store that mints `artifact://` handles.
pub struct MockArtifactStore {
    store_calls: AtomicUsize,
}

impl MockArtifactStore {
    pub fn new() -> Self {
        Self {
            store_calls: AtomicUsize::new(0),
        }
    }

    /// Number of store calls made so far.
    pub fn store_calls(&self) -> usize {
        self.store_calls.load(Ordering::SeqCst)
    }
}

impl Default for MockArtifactStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ArtifactStore for MockArtifactStore {
    async fn store(&self, request_id: &str, _artifact_url: &str) -> Result<String, ProviderError> {
        self.store_calls.fetch_add(1, Ordering::SeqCst);
        Ok(format!("artifact://{}", request_id))
    }
}
