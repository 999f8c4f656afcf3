use crate::types::{GradingOutcome, Participant, Submission};
use redis::{AsyncCommands, RedisResult};

/// Redis key scheme for submission state and grading outcomes.
/// Keys are deterministic so every process reading them agrees on layout.

pub const SUBMISSION_PREFIX: &str = "shortgrade:submission";
pub const OUTCOME_PREFIX: &str = "shortgrade:outcome";
pub const PARTICIPANT_PREFIX: &str = "shortgrade:participant";

/// Outcomes are kept for a week; submissions never expire.
const OUTCOME_TTL_SECS: u64 = 7 * 24 * 3600;

pub fn submission_key(module_id: u32, repo_id: &str) -> String {
    format!("{}:{:02}:{}", SUBMISSION_PREFIX, module_id, repo_id)
}

pub fn outcome_key(module_id: u32, repo_id: &str) -> String {
    format!("{}:{:02}:{}", OUTCOME_PREFIX, module_id, repo_id)
}

pub fn participant_key(login: &str) -> String {
    format!("{}:{}", PARTICIPANT_PREFIX, login)
}

fn encode<T: serde::Serialize>(value: &T) -> RedisResult<String> {
    serde_json::to_string(value).map_err(|e| {
        redis::RedisError::from((redis::ErrorKind::TypeError, "serialization error", e.to_string()))
    })
}

fn decode<T: serde::de::DeserializeOwned>(payload: &str) -> RedisResult<T> {
    serde_json::from_str(payload).map_err(|e| {
        redis::RedisError::from((redis::ErrorKind::TypeError, "deserialization error", e.to_string()))
    })
}

pub async fn get_submission(
    conn: &mut redis::aio::ConnectionManager,
    module_id: u32,
    repo_id: &str,
) -> RedisResult<Option<Submission>> {
    let payload: Option<String> = conn.get(submission_key(module_id, repo_id)).await?;
    payload.as_deref().map(decode).transpose()
}

pub async fn store_submission(
    conn: &mut redis::aio::ConnectionManager,
    submission: &Submission,
) -> RedisResult<()> {
    let key = submission_key(submission.module_id, &submission.repo_id);
    conn.set(key, encode(submission)?).await
}

pub async fn delete_submission(
    conn: &mut redis::aio::ConnectionManager,
    module_id: u32,
    repo_id: &str,
) -> RedisResult<()> {
    conn.del(submission_key(module_id, repo_id)).await
}

/// Every stored submission, optionally restricted to one module.
pub async fn list_submissions(
    conn: &mut redis::aio::ConnectionManager,
    module_id: Option<u32>,
) -> RedisResult<Vec<Submission>> {
    let pattern = match module_id {
        Some(id) => format!("{}:{:02}:*", SUBMISSION_PREFIX, id),
        None => format!("{}:*", SUBMISSION_PREFIX),
    };

    let mut keys = Vec::new();
    {
        let mut iter = conn.scan_match::<_, String>(pattern).await?;
        while let Some(key) = iter.next_item().await {
            keys.push(key);
        }
    }
    keys.sort();

    let mut submissions = Vec::with_capacity(keys.len());
    for key in keys {
        let payload: Option<String> = conn.get(&key).await?;
        if let Some(payload) = payload {
            submissions.push(decode(&payload)?);
        }
    }
    Ok(submissions)
}

pub async fn get_participant(
    conn: &mut redis::aio::ConnectionManager,
    login: &str,
) -> RedisResult<Option<Participant>> {
    let payload: Option<String> = conn.get(participant_key(login)).await?;
    payload.as_deref().map(decode).transpose()
}

pub async fn store_participant(
    conn: &mut redis::aio::ConnectionManager,
    participant: &Participant,
) -> RedisResult<()> {
    conn.set(participant_key(&participant.login), encode(participant)?).await
}

/// Stores the latest outcome for a submission, overwriting the previous one.
pub async fn store_outcome(
    conn: &mut redis::aio::ConnectionManager,
    outcome: &GradingOutcome,
) -> RedisResult<()> {
    let key = outcome_key(outcome.module_id, &outcome.repo_id);
    conn.set_ex(key, encode(outcome)?, OUTCOME_TTL_SECS).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_submission_key_format() {
        assert_eq!(submission_key(3, "alice-03"), "shortgrade:submission:03:alice-03");
    }

    #[test]
    fn test_keys_are_deterministic_and_distinct() {
        assert_eq!(outcome_key(1, "bob-01"), outcome_key(1, "bob-01"));
        assert_ne!(outcome_key(1, "bob-01"), submission_key(1, "bob-01"));
        assert!(outcome_key(1, "bob-01").starts_with("shortgrade:outcome:"));
        assert_eq!(participant_key("bob"), "shortgrade:participant:bob");
    }

    #[test]
    fn test_submission_roundtrips_through_json() {
        let submission = Submission::new(2, "carol-02");
        let decoded: Submission = decode(&encode(&submission).unwrap()).unwrap();
        assert_eq!(decoded, submission);
    }
}
