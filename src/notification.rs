//! # Feed Messages
//!
//! Parsing of inbound `logsSubscribe` traffic. Every text frame is classified into a
//! [`FeedMessage`]; anything that cannot be classified is a [`FeedMessageError`] and is
//! dropped by the supervisor with a warning.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One program-log event observed by the feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogNotification {
    pub signature: String,
    pub slot: u64,
    #[serde(default)]
    pub logs: Vec<String>,
    /// `null` on success, an instruction-error descriptor on failure.
    #[serde(default)]
    pub err: Option<Value>,
}

/// Classified inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum FeedMessage {
    /// JSON-RPC response to our subscribe request.
    SubscriptionAck { request_id: u64, subscription: u64 },
    Notification(LogNotification),
}

#[derive(Debug, thiserror::Error)]
pub enum FeedMessageError {
    #[error("invalid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error("expected a JSON object")]
    NotAnObject,
    #[error("subscription rejected: {0}")]
    SubscriptionRejected(String),
    #[error("no notification result in message")]
    MissingResult,
    #[error("no transaction signature in notification")]
    MissingSignature,
}

impl FeedMessageError {
    /// Label used for the dropped-messages counter.
    pub fn reason(&self) -> &'static str {
        match self {
            FeedMessageError::InvalidJson(_) => "invalid_json",
            FeedMessageError::NotAnObject => "not_an_object",
            FeedMessageError::SubscriptionRejected(_) => "subscription_rejected",
            FeedMessageError::MissingResult => "missing_result",
            FeedMessageError::MissingSignature => "missing_signature",
        }
    }
}

/// Builds the `logsSubscribe` request naming `program_id` as the mention filter.
pub fn subscribe_request(request_id: u64, program_id: &str, commitment: &str) -> Value {
    serde_json::json!({
        "jsonrpc": "2.0",
        "id": request_id,
        "method": "logsSubscribe",
        "params": [
            { "mentions": [program_id] },
            { "commitment": commitment }
        ]
    })
}

/// Classifies one text frame from the feed.
pub fn parse_feed_message(text: &str) -> Result<FeedMessage, FeedMessageError> {
    let data: Value = serde_json::from_str(text)?;
    let obj = data.as_object().ok_or(FeedMessageError::NotAnObject)?;

    if let Some(err) = obj.get("error") {
        return Err(FeedMessageError::SubscriptionRejected(err.to_string()));
    }

    // {"jsonrpc":"2.0","result":24040,"id":1}
    if let (Some(subscription), Some(request_id)) = (
        obj.get("result").and_then(Value::as_u64),
        obj.get("id").and_then(Value::as_u64),
    ) {
        return Ok(FeedMessage::SubscriptionAck {
            request_id,
            subscription,
        });
    }

    let result = obj
        .get("params")
        .and_then(|p| p.get("result"))
        .filter(|r| r.as_object().map_or(false, |m| !m.is_empty()))
        .ok_or(FeedMessageError::MissingResult)?;

    let value = result.get("value").unwrap_or(&Value::Null);
    let signature = value
        .get("signature")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .ok_or(FeedMessageError::MissingSignature)?;

    let slot = result
        .pointer("/context/slot")
        .and_then(Value::as_u64)
        .unwrap_or_default();

    let logs = value
        .get("logs")
        .and_then(Value::as_array)
        .map(|lines| {
            lines
                .iter()
                .filter_map(|l| l.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default();

    let err = value.get("err").filter(|e| !e.is_null()).cloned();

    Ok(FeedMessage::Notification(LogNotification {
        signature: signature.to_string(),
        slot,
        logs,
        err,
    }))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionStatus {
    Success,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SwapDetails {
    pub dex: &'static str,
    pub amount_in: u64,
    pub amount_out: u64,
}

/// Human-oriented digest of a notification, logged once per event.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NotificationSummary {
    pub signature: String,
    pub slot: u64,
    pub status: TransactionStatus,
    pub swap: Option<SwapDetails>,
    pub logs: Vec<String>,
}

impl LogNotification {
    pub fn status(&self) -> TransactionStatus {
        match self.err {
            Some(_) => TransactionStatus::Failed,
            None => TransactionStatus::Success,
        }
    }

    pub fn summary(&self) -> NotificationSummary {
        NotificationSummary {
            signature: self.signature.clone(),
            slot: self.slot,
            status: self.status(),
            swap: parse_swap_details(&self.logs),
            logs: self.logs.clone(),
        }
    }
}

/// Finds the first log line reporting both `amount_in: <n>` and `amount_out: <m>`.
pub fn parse_swap_details(logs: &[String]) -> Option<SwapDetails> {
    logs.iter().find_map(|line| {
        let amount_in = amount_after(line, "amount_in:")?;
        let amount_out = amount_after(line, "amount_out:")?;
        Some(SwapDetails {
            dex: "Raydium",
            amount_in,
            amount_out,
        })
    })
}

fn amount_after(line: &str, label: &str) -> Option<u64> {
    let start = line.find(label)? + label.len();
    let digits: String = line[start..]
        .trim_start()
        .chars()
        .take_while(char::is_ascii_digit)
        .collect();
    digits.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn notification_frame(signature: Value, err: Value, slot: u64, logs: Vec<&str>) -> String {
        json!({
            "jsonrpc": "2.0",
            "method": "logsNotification",
            "params": {
                "result": {
                    "context": { "slot": slot },
                    "value": { "signature": signature, "err": err, "logs": logs }
                },
                "subscription": 24040
            }
        })
        .to_string()
    }

    #[test]
    fn test_subscribe_request_shape() {
        let req = subscribe_request(1, "675kPX9MHTjS2zt1qfr1NYHuzeLXfQM9H24wFSUt1Mp8", "processed");
        assert_eq!(req["method"], "logsSubscribe");
        assert_eq!(req["params"][0]["mentions"][0], "675kPX9MHTjS2zt1qfr1NYHuzeLXfQM9H24wFSUt1Mp8");
        assert_eq!(req["params"][1]["commitment"], "processed");
    }

    #[test]
    fn test_parse_subscription_ack() {
        let msg = parse_feed_message(r#"{"jsonrpc":"2.0","result":24040,"id":1}"#).unwrap();
        assert_eq!(
            msg,
            FeedMessage::SubscriptionAck {
                request_id: 1,
                subscription: 24040
            }
        );
    }

    #[test]
    fn test_parse_successful_notification() {
        let frame = notification_frame(
            json!("sigA"),
            Value::Null,
            12345,
            vec!["Program log: RaydiumSwap amount_in: 1000, amount_out: 2000"],
        );
        let FeedMessage::Notification(n) = parse_feed_message(&frame).unwrap() else {
            panic!("expected notification");
        };
        assert_eq!(n.signature, "sigA");
        assert_eq!(n.slot, 12345);
        assert!(n.err.is_none());

        let summary = n.summary();
        assert_eq!(summary.status, TransactionStatus::Success);
        assert_eq!(
            summary.swap,
            Some(SwapDetails {
                dex: "Raydium",
                amount_in: 1000,
                amount_out: 2000
            })
        );
    }

    #[test]
    fn test_parse_failed_notification() {
        let frame = notification_frame(
            json!("failed_signature"),
            json!({ "InstructionError": [2, { "Custom": 6001 }] }),
            67890,
            vec!["Program log: Transaction failed", "Program log: Slippage tolerance exceeded"],
        );
        let FeedMessage::Notification(n) = parse_feed_message(&frame).unwrap() else {
            panic!("expected notification");
        };
        let summary = n.summary();
        assert_eq!(summary.status, TransactionStatus::Failed);
        assert_eq!(summary.slot, 67890);
        assert!(summary.swap.is_none());
        assert!(summary.logs.iter().any(|l| l.contains("Slippage tolerance exceeded")));
    }

    #[test]
    fn test_malformed_messages_are_errors() {
        assert!(matches!(parse_feed_message("{not json"), Err(FeedMessageError::InvalidJson(_))));
        assert!(matches!(parse_feed_message("[1,2]"), Err(FeedMessageError::NotAnObject)));
        assert!(matches!(
            parse_feed_message(r#"{"jsonrpc":"2.0","method":"logsNotification","params":{}}"#),
            Err(FeedMessageError::MissingResult)
        ));
        let no_sig = notification_frame(Value::Null, Value::Null, 1, vec![]);
        assert!(matches!(parse_feed_message(&no_sig), Err(FeedMessageError::MissingSignature)));
        let empty_sig = notification_frame(json!(""), Value::Null, 1, vec![]);
        assert!(matches!(parse_feed_message(&empty_sig), Err(FeedMessageError::MissingSignature)));
    }

    #[test]
    fn test_subscription_error_response() {
        let err = parse_feed_message(
            r#"{"jsonrpc":"2.0","error":{"code":-32602,"message":"Invalid params"},"id":1}"#,
        )
        .unwrap_err();
        assert_eq!(err.reason(), "subscription_rejected");
    }

    #[test]
    fn test_parse_swap_details_variants() {
        let logs = vec![
            "Program log: Tokens: SOL, USDC".to_string(),
            "Program log: RaydiumSwap amount_in: 500, amount_out: 1000".to_string(),
        ];
        let swap = parse_swap_details(&logs).unwrap();
        assert_eq!((swap.amount_in, swap.amount_out), (500, 1000));

        let partial = vec!["Program log: amount_in: 7".to_string()];
        assert!(parse_swap_details(&partial).is_none());
    }
}
