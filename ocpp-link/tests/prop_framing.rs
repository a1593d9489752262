//! Property tests for OCPP-J framing
//!
//! Tests invariants for:
//! - Parsing: arbitrary input never panics
//! - Correlation: message ids survive serialize -> parse unchanged
//! - Error codes: unknown codes degrade to GenericError
//! - State machine: disconnect always wins

use ocpp_link::ocpp::*;
use proptest::prelude::*;
use serde_json::{json, Value};

// ============================================================================
// Strategies
// ============================================================================

fn message_id() -> impl Strategy<Value = String> {
    "[a-zA-Z0-9-]{1,36}"
}

fn action_name() -> impl Strategy<Value = String> {
    "[A-Z][a-zA-Z]{0,30}"
}

fn small_payload() -> impl Strategy<Value = Value> {
    prop_oneof![
        Just(json!({})),
        any::<i32>().prop_map(|n| json!({ "connectorId": n })),
        "[a-zA-Z0-9]{0,20}".prop_map(|s| json!({ "idTag": s })),
        any::<bool>().prop_map(|b| json!({ "flag": b, "nested": { "list": [1, 2, 3] } })),
    ]
}

fn json_scalar() -> impl Strategy<Value = Value> {
    prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::from),
        (-10i64..10).prop_map(Value::from),
        "[a-z0-9]{0,8}".prop_map(Value::from),
        Just(json!({})),
    ]
}

fn transition() -> impl Strategy<Value = Transition> {
    prop_oneof![
        Just(Transition::Connect),
        Just(Transition::Opened),
        Just(Transition::OpenFailed),
        Just(Transition::Lost),
        Just(Transition::RetriesExhausted),
        Just(Transition::Disconnect),
    ]
}

// ============================================================================
// Parsing Robustness
// ============================================================================

proptest! {
    /// Arbitrary text is either parsed or rejected, never a panic
    #[test]
    fn parse_never_panics(text in ".{0,200}") {
        let _ = OcppMessage::parse(&text);
    }

    /// Arrays of arbitrary shape are either parsed or rejected, never a panic
    #[test]
    fn parse_arbitrary_arrays(items in prop::collection::vec(json_scalar(), 0..7)) {
        let text = Value::Array(items).to_string();
        let _ = OcppMessage::parse(&text);
    }

    /// Wrong arity for a known type tag is rejected
    #[test]
    fn wrong_arity_rejected(tag in 2i64..=4, extra in 0usize..3) {
        let expected = match tag {
            2 => 4,
            3 => 3,
            _ => 5,
        };
        let len = if extra == 0 { expected - 1 } else { expected + extra };
        let mut items = vec![json!(tag)];
        items.resize(len, json!("x"));

        let text = Value::Array(items).to_string();
        prop_assert!(OcppMessage::parse(&text).is_err());
    }

    /// Type tags outside 2..=4 are rejected
    #[test]
    fn unknown_type_tag_rejected(tag in 5i64..1000, id in message_id()) {
        let text = json!([tag, id, {}]).to_string();
        let rejected = matches!(
            OcppMessage::parse(&text),
            Err(OcppError::UnknownMessageType(t)) if t == tag
        );
        prop_assert!(rejected);
    }
}

// ============================================================================
// Correlation Property Tests
// ============================================================================

proptest! {
    /// CORE INVARIANT: a CALL keeps its message id and action through the wire
    #[test]
    fn call_preserves_id_and_action(
        id in message_id(),
        action in action_name(),
        payload in small_payload()
    ) {
        let call = Call { message_id: id.clone(), action: action.clone(), payload: payload.clone() };
        let text = call.to_text().unwrap();

        match OcppMessage::parse(&text).unwrap() {
            OcppMessage::Call(parsed) => {
                prop_assert_eq!(parsed.message_id, id);
                prop_assert_eq!(parsed.action, action);
                prop_assert_eq!(parsed.payload, payload);
            }
            other => prop_assert!(false, "Expected Call, got {:?}", other),
        }
    }

    /// A CALLRESULT keeps the id it answers
    #[test]
    fn call_result_preserves_id(id in message_id(), payload in small_payload()) {
        let result = CallResult::new(id.clone(), &payload).unwrap();
        let parsed = OcppMessage::parse(&result.to_text().unwrap()).unwrap();

        prop_assert_eq!(parsed.message_id(), id.as_str());
        let is_result = matches!(parsed, OcppMessage::CallResult(_));
        prop_assert!(is_result);
    }

    /// Fresh CALLs never share an id
    #[test]
    fn generated_ids_are_unique(n in 2usize..50) {
        let mut ids: Vec<String> = (0..n)
            .map(|_| Call::heartbeat().unwrap().message_id)
            .collect();
        ids.sort();
        ids.dedup();
        prop_assert_eq!(ids.len(), n);
    }
}

// ============================================================================
// Error Code Property Tests
// ============================================================================

proptest! {
    /// Codes outside OCPP 1.6 become GenericError, the rest of the frame survives
    #[test]
    fn unknown_error_code_is_generic(
        id in message_id(),
        code in "X[a-zA-Z]{0,20}",
        description in "[a-z ]{0,40}"
    ) {
        let text = json!([4, id, code, description, {}]).to_string();

        match OcppMessage::parse(&text).unwrap() {
            OcppMessage::CallError(error) => {
                prop_assert_eq!(error.error_code, ErrorCode::GenericError);
                prop_assert_eq!(error.message_id, id);
                prop_assert_eq!(error.error_description, description);
            }
            other => prop_assert!(false, "Expected CallError, got {:?}", other),
        }
    }
}

// ============================================================================
// State Machine Property Tests
// ============================================================================

proptest! {
    /// Disconnect is legal from every reachable state and always lands in Disconnected
    #[test]
    fn disconnect_always_wins(transitions in prop::collection::vec(transition(), 0..30)) {
        let mut state = ConnectionState::Disconnected;
        for t in transitions {
            if let Some(next) = state.apply(t) {
                state = next;
            }
        }

        prop_assert_eq!(state.apply(Transition::Disconnect), Some(ConnectionState::Disconnected));
    }

    /// Connected is only ever entered from Connecting
    #[test]
    fn connected_only_via_connecting(transitions in prop::collection::vec(transition(), 0..30)) {
        let mut state = ConnectionState::Disconnected;
        for t in transitions {
            if let Some(next) = state.apply(t) {
                if next == ConnectionState::Connected && state != ConnectionState::Connected {
                    prop_assert_eq!(state, ConnectionState::Connecting);
                }
                state = next;
            }
        }
    }

    /// Transaction ids strictly increase below the wrap point
    #[test]
    fn transaction_ids_increase(first in 1i32..1_000_000, n in 2usize..100) {
        let ids = TransactionIds::starting_at(first);
        let allocated: Vec<i32> = (0..n).map(|_| ids.next()).collect();

        prop_assert_eq!(allocated[0], first);
        prop_assert!(allocated.windows(2).all(|w| w[1] == w[0] + 1));
    }
}
