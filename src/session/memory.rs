//! In-memory session store with a capacity cap.
//!
//! Eviction removes the least-recently-updated session once the cap is
//! reached. Checkpoints live in a thread-id-keyed map beside the sessions.

use serde_json::Value;
use std::collections::HashMap;
use tokio::sync::RwLock;

use super::{Message, QueryStatus, Session};

pub struct MemorySessionStore {
    sessions: RwLock<HashMap<String, Session>>,
    checkpoints: RwLock<HashMap<String, Value>>,
    max_sessions: usize,
}

impl MemorySessionStore {
    pub fn new(max_sessions: usize) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            checkpoints: RwLock::new(HashMap::new()),
            max_sessions,
        }
    }

    pub async fn create(
        &self,
        session_id: &str,
        db_name: Option<&str>,
    ) -> Result<Session, String> {
        let mut sessions = self.sessions.write().await;

        if sessions.len() >= self.max_sessions {
            // Evict the least-recently-updated session.
            if let Some(oldest) = sessions
                .values()
                .min_by_key(|s| s.updated_at)
                .map(|s| s.session_id.clone())
            {
                println!("[SessionStore] Capacity reached, evicting {}", oldest);
                sessions.remove(&oldest);
            }
        }

        let session = Session::new(session_id.to_string(), db_name.map(|s| s.to_string()));
        sessions.insert(session_id.to_string(), session.clone());
        Ok(session)
    }

    pub async fn get(&self, session_id: &str) -> Option<Session> {
        self.sessions.read().await.get(session_id).cloned()
    }

    pub async fn update(&self, session: &Session) -> Result<(), String> {
        let mut sessions = self.sessions.write().await;
        sessions.insert(session.session_id.clone(), session.clone());
        Ok(())
    }

    pub async fn update_status(
        &self,
        session_id: &str,
        status: QueryStatus,
    ) -> Result<(), String> {
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .get_mut(session_id)
            .ok_or_else(|| format!("Session {} not found", session_id))?;
        session.status = status;
        session.touch();
        Ok(())
    }

    pub async fn delete(&self, session_id: &str) -> Result<bool, String> {
        let mut sessions = self.sessions.write().await;
        Ok(sessions.remove(session_id).is_some())
    }

    pub async fn list_all(&self, limit: usize, offset: usize) -> Result<Vec<Session>, String> {
        let sessions = self.sessions.read().await;
        let mut all: Vec<Session> = sessions.values().cloned().collect();
        all.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(all.into_iter().skip(offset).take(limit).collect())
    }

    pub async fn count(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn get_message(&self, message_id: &str) -> Option<Message> {
        let sessions = self.sessions.read().await;
        for session in sessions.values() {
            if let Some(message) = session.messages.get(message_id) {
                return Some(message.clone());
            }
        }
        None
    }

    pub async fn mark_as_few_shot(&self, message_id: &str) -> Result<Message, String> {
        let mut sessions = self.sessions.write().await;
        for session in sessions.values_mut() {
            if let Some(message) = session.messages.get_mut(message_id) {
                message.is_few_shot = true;
                let marked = message.clone();
                session.touch();
                return Ok(marked);
            }
        }
        Err(format!("Message {} not found", message_id))
    }

    pub async fn save_checkpoint(&self, thread_id: &str, checkpoint: Value) -> Result<(), String> {
        self.checkpoints
            .write()
            .await
            .insert(thread_id.to_string(), checkpoint);
        Ok(())
    }

    pub async fn load_checkpoint(&self, thread_id: &str) -> Option<Value> {
        self.checkpoints.read().await.get(thread_id).cloned()
    }

    pub async fn delete_checkpoint(&self, thread_id: &str) {
        self.checkpoints.write().await.remove(thread_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::MessageRole;
    use chrono::Utc;

    #[tokio::test]
    async fn test_create_get_delete() {
        let store = MemorySessionStore::new(10);
        store.create("s1", Some("medical")).await.unwrap();

        let session = store.get("s1").await.unwrap();
        assert_eq!(session.db_name.as_deref(), Some("medical"));
        assert_eq!(session.status, QueryStatus::Pending);

        assert!(store.delete("s1").await.unwrap());
        assert!(store.get("s1").await.is_none());
        assert!(!store.delete("s1").await.unwrap());
    }

    #[tokio::test]
    async fn test_capacity_evicts_least_recently_updated() {
        let store = MemorySessionStore::new(2);
        store.create("s1", None).await.unwrap();
        store.create("s2", None).await.unwrap();

        // Touch s1 so s2 becomes the eviction candidate.
        store
            .update_status("s1", QueryStatus::Processing)
            .await
            .unwrap();

        store.create("s3", None).await.unwrap();
        assert!(store.get("s1").await.is_some());
        assert!(store.get("s2").await.is_none());
        assert!(store.get("s3").await.is_some());
        assert_eq!(store.count().await, 2);
    }

    #[tokio::test]
    async fn test_list_all_newest_first() {
        let store = MemorySessionStore::new(10);
        store.create("s1", None).await.unwrap();
        store.create("s2", None).await.unwrap();
        store
            .update_status("s1", QueryStatus::Completed)
            .await
            .unwrap();

        let listed = store.list_all(10, 0).await.unwrap();
        assert_eq!(listed[0].session_id, "s1");
    }

    #[tokio::test]
    async fn test_message_lookup_and_few_shot_marking() {
        let store = MemorySessionStore::new(10);
        let mut session = store.create("s1", None).await.unwrap();
        session.add_message(Message {
            message_id: "m1".to_string(),
            session_id: "s1".to_string(),
            thread_id: "s1".to_string(),
            parent_id: None,
            role: MessageRole::Assistant,
            content: Some("done".to_string()),
            generated_sql: Some("SELECT 1".to_string()),
            tables_used: vec![],
            validation_passed: Some(true),
            user_answer: None,
            clarification_questions: None,
            is_few_shot: false,
            token_count: None,
            branch_id: None,
            root_message_id: None,
            checkpoint_id: None,
            created_at: Utc::now(),
        });
        store.update(&session).await.unwrap();

        let marked = store.mark_as_few_shot("m1").await.unwrap();
        assert!(marked.is_few_shot);
        assert!(store.get_message("m1").await.unwrap().is_few_shot);
        assert!(store.mark_as_few_shot("missing").await.is_err());
    }

    #[tokio::test]
    async fn test_checkpoints_keyed_by_thread() {
        let store = MemorySessionStore::new(10);
        store
            .save_checkpoint("t1", serde_json::json!({"node": "clarify"}))
            .await
            .unwrap();

        assert_eq!(
            store.load_checkpoint("t1").await.unwrap()["node"],
            "clarify"
        );
        assert!(store.load_checkpoint("t2").await.is_none());

        store.delete_checkpoint("t1").await;
        assert!(store.load_checkpoint("t1").await.is_none());
    }
}
