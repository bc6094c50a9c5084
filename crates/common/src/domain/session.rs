use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle of a weigh session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Created,
    Capturing,
    Finalized,
    Failed,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Created => "created",
            SessionState::Capturing => "capturing",
            SessionState::Finalized => "finalized",
            SessionState::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Finalized | SessionState::Failed)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Durable reference to an uploaded image
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaRef {
    pub media_id: String,
    pub object_key: String,
    pub content_type: String,
    pub size_bytes: usize,
}

/// One capture session as owned by the processing loop
#[derive(Debug, Clone, PartialEq)]
pub struct Session {
    pub session_id: String,
    pub batch_id: Option<String>,
    pub trace_id: String,
    pub state: SessionState,
    pub images: Vec<MediaRef>,
    pub weights: Vec<f64>,
    pub final_weight: Option<f64>,
    pub started_at: DateTime<Utc>,
}

impl Session {
    pub fn new(
        session_id: String,
        batch_id: Option<String>,
        trace_id: String,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            session_id,
            batch_id,
            trace_id,
            state: SessionState::Created,
            images: Vec::new(),
            weights: Vec::new(),
            final_weight: None,
            started_at,
        }
    }

    /// Arithmetic mean of the recorded weights, `None` when nothing was recorded
    pub fn mean_weight(&self) -> Option<f64> {
        if self.weights.is_empty() {
            return None;
        }
        Some(self.weights.iter().sum::<f64>() / self.weights.len() as f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> Session {
        Session::new("sess-1".to_string(), None, "trace-1".to_string(), Utc::now())
    }

    #[test]
    fn test_mean_weight() {
        let mut s = session();
        s.weights = vec![120.0, 120.5, 120.3];

        let mean = s.mean_weight().unwrap();
        assert!((mean - 120.267).abs() < 0.01);
    }

    #[test]
    fn test_mean_weight_empty() {
        assert_eq!(session().mean_weight(), None);
    }

    #[test]
    fn test_terminal_states() {
        assert!(!SessionState::Created.is_terminal());
        assert!(!SessionState::Capturing.is_terminal());
        assert!(SessionState::Finalized.is_terminal());
        assert!(SessionState::Failed.is_terminal());
    }
}
