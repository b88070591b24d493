//! Multi-turn conversation scenarios: cache reuse after shift detection,
//! context merging, and history carryover.

use serde_json::json;

use super::{build_engine, structured_reply, table_hit, text_reply, tool_call_reply};
use crate::session::QueryStatus;

fn clear_analysis() -> crate::actors::llm_gateway_actor::ScriptedReply {
    structured_reply(json!({ "is_clear": true }))
}

#[tokio::test]
async fn test_follow_up_reuses_cached_context_without_shift() {
    let engine = build_engine(
        vec![
            // --- turn 1 ---
            clear_analysis(),
            tool_call_reply(
                "validate_sql",
                json!({ "sql": "SELECT name FROM patient" }),
                "call_1",
            ),
            text_reply("```sql\nSELECT name FROM patient\n```"),
            // --- turn 2 ---
            clear_analysis(),
            // shift detection: only sorting changed, reuse the cache
            structured_reply(json!({
                "needs_new_tables": false,
                "reason": "follow-up only changes ordering",
                "suggested_tables": [],
            })),
            tool_call_reply(
                "validate_sql",
                json!({ "sql": "SELECT name FROM patient ORDER BY name" }),
                "call_2",
            ),
            text_reply("```sql\nSELECT name FROM patient ORDER BY name\n```"),
        ],
        vec![table_hit("patient", 0.9)],
        vec![],
        |_| {},
    )
    .await;

    let session = engine.service.create_session(Some("medical")).await.unwrap();

    let first = engine
        .service
        .execute_query(&session.session_id, "list patient names")
        .await
        .unwrap();
    assert_eq!(first.status, QueryStatus::Completed);

    let second = engine
        .service
        .execute_query(&session.session_id, "sort them alphabetically")
        .await
        .unwrap();
    assert_eq!(second.status, QueryStatus::Completed);
    assert!(second.sql.unwrap().contains("ORDER BY"));

    let stored = engine.service.store().get(&session.session_id).await.unwrap();
    assert_eq!(stored.turns.len(), 2);

    let carryover = stored.state.unwrap();
    let history = carryover["conversation_history"].as_array().unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0]["question"], "list patient names");
    assert_eq!(history[1]["question"], "sort them alphabetically");

    // The cached table scope survived the reuse.
    let tables: Vec<&str> = carryover["cached_retrieval"]["tables"]
        .as_array()
        .unwrap()
        .iter()
        .filter_map(|v| v.as_str())
        .collect();
    assert!(tables.contains(&"patient"));
}

#[tokio::test]
async fn test_shift_forces_new_retrieval_and_merges_tables() {
    let engine = build_engine(
        vec![
            // --- turn 1 ---
            clear_analysis(),
            tool_call_reply(
                "validate_sql",
                json!({ "sql": "SELECT name FROM patient" }),
                "call_1",
            ),
            text_reply("```sql\nSELECT name FROM patient\n```"),
            // --- turn 2 ---
            clear_analysis(),
            // shift detection: fees are out of scope of the cache
            structured_reply(json!({
                "needs_new_tables": true,
                "reason": "fees require the fee_record table",
                "suggested_tables": ["fee_record"],
            })),
            tool_call_reply(
                "validate_sql",
                json!({ "sql": "SELECT v.visit_id, f.amount FROM visit v JOIN fee_record f ON f.visit_id = v.visit_id" }),
                "call_2",
            ),
            text_reply(
                "```sql\nSELECT v.visit_id, f.amount FROM visit v JOIN fee_record f ON f.visit_id = v.visit_id\n```",
            ),
        ],
        // The stub returns the same hits for every search; they cover the
        // second question's scope.
        vec![table_hit("visit", 0.85), table_hit("fee_record", 0.8)],
        vec![],
        |_| {},
    )
    .await;

    let session = engine.service.create_session(Some("medical")).await.unwrap();

    engine
        .service
        .execute_query(&session.session_id, "list patient names")
        .await
        .unwrap();

    let second = engine
        .service
        .execute_query(&session.session_id, "what fees did each visit incur")
        .await
        .unwrap();
    assert_eq!(second.status, QueryStatus::Completed);

    // The merged scope keeps the first turn's tables and adds the new ones.
    let stored = engine.service.store().get(&session.session_id).await.unwrap();
    let carryover = stored.state.unwrap();
    let tables: Vec<&str> = carryover["cached_retrieval"]["tables"]
        .as_array()
        .unwrap()
        .iter()
        .filter_map(|v| v.as_str())
        .collect();
    assert!(tables.contains(&"visit"));
    assert!(tables.contains(&"fee_record"));
}

#[tokio::test]
async fn test_shift_detection_failure_is_conservative() {
    let engine = build_engine(
        vec![
            // --- turn 1 ---
            clear_analysis(),
            tool_call_reply(
                "validate_sql",
                json!({ "sql": "SELECT name FROM patient" }),
                "call_1",
            ),
            text_reply("```sql\nSELECT name FROM patient\n```"),
            // --- turn 2 ---
            clear_analysis(),
            // shift detection LLM call fails
            crate::actors::llm_gateway_actor::ScriptedReply {
                error: Some("provider 500".to_string()),
                ..Default::default()
            },
            tool_call_reply(
                "validate_sql",
                json!({ "sql": "SELECT gender, COUNT(*) FROM patient GROUP BY gender" }),
                "call_2",
            ),
            text_reply("```sql\nSELECT gender, COUNT(*) FROM patient GROUP BY gender\n```"),
        ],
        vec![table_hit("patient", 0.9)],
        vec![],
        |_| {},
    )
    .await;

    let session = engine.service.create_session(Some("medical")).await.unwrap();
    engine
        .service
        .execute_query(&session.session_id, "list patient names")
        .await
        .unwrap();

    let second = engine
        .service
        .execute_query(&session.session_id, "group by gender")
        .await
        .unwrap();

    // Detection failure forces a fresh retrieval but never kills the turn.
    assert_eq!(second.status, QueryStatus::Completed);
    assert_eq!(second.validation_passed, Some(true));
}
