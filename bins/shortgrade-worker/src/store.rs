// Submission persistence seam: Redis in production, memory for tests and dev.
use async_trait::async_trait;
use shortgrade_common::redis as keys;
use shortgrade_common::types::{GradingOutcome, Participant, Submission};
use std::collections::BTreeMap;
use thiserror::Error;
use tokio::sync::Mutex;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
}

#[async_trait]
pub trait SubmissionStore: Send + Sync {
    async fn get(&self, module_id: u32, repo_id: &str) -> Result<Option<Submission>, StoreError>;
    async fn update(&self, submission: &Submission) -> Result<(), StoreError>;
    async fn delete(&self, module_id: u32, repo_id: &str) -> Result<(), StoreError>;
    async fn get_all(&self, module_id: Option<u32>) -> Result<Vec<Submission>, StoreError>;
    async fn record_outcome(&self, outcome: &GradingOutcome) -> Result<(), StoreError>;
    async fn get_participant(&self, login: &str) -> Result<Option<Participant>, StoreError>;
    async fn update_participant(&self, participant: &Participant) -> Result<(), StoreError>;
}

#[derive(Clone)]
pub struct RedisStore {
    conn: redis::aio::ConnectionManager,
}

impl RedisStore {
    pub fn new(conn: redis::aio::ConnectionManager) -> Self {
        Self { conn }
    }
}

#[async_trait]
impl SubmissionStore for RedisStore {
    async fn get(&self, module_id: u32, repo_id: &str) -> Result<Option<Submission>, StoreError> {
        let mut conn = self.conn.clone();
        Ok(keys::get_submission(&mut conn, module_id, repo_id).await?)
    }

    async fn update(&self, submission: &Submission) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        Ok(keys::store_submission(&mut conn, submission).await?)
    }

    async fn delete(&self, module_id: u32, repo_id: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        Ok(keys::delete_submission(&mut conn, module_id, repo_id).await?)
    }

    async fn get_all(&self, module_id: Option<u32>) -> Result<Vec<Submission>, StoreError> {
        let mut conn = self.conn.clone();
        Ok(keys::list_submissions(&mut conn, module_id).await?)
    }

    async fn record_outcome(&self, outcome: &GradingOutcome) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        Ok(keys::store_outcome(&mut conn, outcome).await?)
    }

    async fn get_participant(&self, login: &str) -> Result<Option<Participant>, StoreError> {
        let mut conn = self.conn.clone();
        Ok(keys::get_participant(&mut conn, login).await?)
    }

    async fn update_participant(&self, participant: &Participant) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        Ok(keys::store_participant(&mut conn, participant).await?)
    }
}

#[derive(Default)]
pub struct MemoryStore {
    submissions: Mutex<BTreeMap<(u32, String), Submission>>,
    outcomes: Mutex<Vec<GradingOutcome>>,
    participants: Mutex<BTreeMap<String, Participant>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every outcome recorded so far, oldest first.
    #[cfg(test)]
    pub async fn outcomes(&self) -> Vec<GradingOutcome> {
        self.outcomes.lock().await.clone()
    }
}

#[async_trait]
impl SubmissionStore for MemoryStore {
    async fn get(&self, module_id: u32, repo_id: &str) -> Result<Option<Submission>, StoreError> {
        let submissions = self.submissions.lock().await;
        Ok(submissions.get(&(module_id, repo_id.to_string())).cloned())
    }

    async fn update(&self, submission: &Submission) -> Result<(), StoreError> {
        let key = (submission.module_id, submission.repo_id.clone());
        self.submissions.lock().await.insert(key, submission.clone());
        Ok(())
    }

    async fn delete(&self, module_id: u32, repo_id: &str) -> Result<(), StoreError> {
        self.submissions.lock().await.remove(&(module_id, repo_id.to_string()));
        Ok(())
    }

    async fn get_all(&self, module_id: Option<u32>) -> Result<Vec<Submission>, StoreError> {
        let submissions = self.submissions.lock().await;
        Ok(submissions
            .values()
            .filter(|s| module_id.map_or(true, |id| s.module_id == id))
            .cloned()
            .collect())
    }

    async fn record_outcome(&self, outcome: &GradingOutcome) -> Result<(), StoreError> {
        self.outcomes.lock().await.push(outcome.clone());
        Ok(())
    }

    async fn get_participant(&self, login: &str) -> Result<Option<Participant>, StoreError> {
        Ok(self.participants.lock().await.get(login).cloned())
    }

    async fn update_participant(&self, participant: &Participant) -> Result<(), StoreError> {
        self.participants
            .lock()
            .await
            .insert(participant.login.clone(), participant.clone());
        Ok(())
    }
}
