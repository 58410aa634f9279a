//! Normalizes upstream fill payloads into [`Event`]s.
//!
//! The gateway is loosely typed: a payload may be a whole block of fills or a
//! single `[user, fill]` pair, and numbers arrive either as strings or as JSON
//! numbers. Every field is extracted on its own so that one missing field
//! never drops the rest of the fill.

use std::str::FromStr;

use chrono::{DateTime, NaiveDateTime, Utc};
use rust_decimal::Decimal;
use serde_json::{Map, Value};
use tracing::debug;

use crate::error::{DecodeError, ParseWarning};
use crate::types::{Event, EventId, GroupBy, LiquidationInfo};

/// Events decoded from one payload.
#[derive(Debug, Default)]
pub struct DecodedBlock {
    pub block_number: Option<u64>,
    pub events: Vec<Event>,
    /// Fills with no value for the grouping field.
    pub skipped: usize,
    /// Entries that were not fills, or fills without an identifier.
    pub invalid: usize,
}

struct BlockContext {
    group_by: GroupBy,
    block_number: Option<u64>,
    block_time: Option<DateTime<Utc>>,
}

/// Decode one payload.
///
/// Accepted shapes:
/// - `{"block_number": n, "block_time": "...", "events": [[user, fill], ...]}`
///   (`height`, `time` and `fills` are accepted as alternative keys; `fills`
///   is used when `events` is null or empty)
/// - `[user, fill]`
/// - `[[user, fill], ...]`
///
/// Entries may also be fill objects carrying their own `"user"` field.
pub fn decode_payload(payload: &[u8], group_by: GroupBy) -> Result<DecodedBlock, DecodeError> {
    let value: Value = serde_json::from_slice(payload)?;
    let mut block = DecodedBlock::default();

    match &value {
        Value::Object(obj) => {
            let events = obj.get("events").and_then(Value::as_array);
            let entries = events
                .filter(|events| !events.is_empty())
                .or_else(|| obj.get("fills").and_then(Value::as_array))
                .or(events)
                .ok_or(DecodeError::UnexpectedShape("object without events or fills"))?;
            block.block_number = obj
                .get("block_number")
                .or_else(|| obj.get("height"))
                .and_then(as_u64);
            let block_time = obj
                .get("block_time")
                .and_then(parse_timestamp)
                .or_else(|| obj.get("time").and_then(parse_timestamp));
            let ctx = BlockContext {
                group_by,
                block_number: block.block_number,
                block_time,
            };
            for entry in entries {
                decode_entry(entry, &ctx, &mut block);
            }
        }
        Value::Array(items) => {
            let ctx = BlockContext {
                group_by,
                block_number: None,
                block_time: None,
            };
            if as_pair(&value).is_some() {
                decode_entry(&value, &ctx, &mut block);
            } else {
                for entry in items {
                    decode_entry(entry, &ctx, &mut block);
                }
            }
        }
        _ => return Err(DecodeError::UnexpectedShape("expected an object or array")),
    }

    Ok(block)
}

fn decode_entry(entry: &Value, ctx: &BlockContext, block: &mut DecodedBlock) {
    let (user, fill) = match entry {
        Value::Object(fill) => (
            fill.get("user").and_then(Value::as_str).unwrap_or_default(),
            fill,
        ),
        other => match as_pair(other) {
            Some(pair) => pair,
            None => {
                debug!("Skipping entry that is not a fill");
                block.invalid += 1;
                return;
            }
        },
    };

    match build_event(user, fill, ctx) {
        Ok(Some(event)) => block.events.push(event),
        Ok(None) => block.skipped += 1,
        Err(reason) => {
            debug!("Skipping fill: {reason}");
            block.invalid += 1;
        }
    }
}

/// `[user, fill, ..]` where `user` is a string and `fill` an object.
fn as_pair(value: &Value) -> Option<(&str, &Map<String, Value>)> {
    match value.as_array()?.as_slice() {
        [user, fill, ..] => Some((user.as_str()?, fill.as_object()?)),
        _ => None,
    }
}

fn build_event(
    user: &str,
    fill: &Map<String, Value>,
    ctx: &BlockContext,
) -> Result<Option<Event>, &'static str> {
    let participant = user.trim().to_lowercase();
    let key = match ctx.group_by {
        GroupBy::Builder => text(fill.get("builder")).map(|b| b.to_lowercase()),
        GroupBy::User => Some(participant.clone()).filter(|p| !p.is_empty()),
        GroupBy::Coin => text(fill.get("coin")),
    };
    let Some(key) = key else {
        return Ok(None);
    };

    let size = text(fill.get("sz"));
    let id = text(fill.get("hash"))
        .or_else(|| text(fill.get("tid")))
        .and_then(|hash| {
            EventId::composite(&hash, &participant, size.as_deref().unwrap_or_default())
        })
        .ok_or("fill has neither hash nor tid")?;

    // Builder revenue is the builder fee; per-account stats use the exchange fee.
    let fee_field = match ctx.group_by {
        GroupBy::Builder => "builderFee",
        GroupBy::User | GroupBy::Coin => "fee",
    };

    Ok(Some(Event {
        id,
        key,
        participant,
        coin: text(fill.get("coin")),
        side: text(fill.get("side")),
        price: text(fill.get("px")),
        size,
        fee: text(fill.get(fee_field)),
        fee_token: text(fill.get("feeToken")),
        closed_pnl: text(fill.get("closedPnl")),
        timestamp: fill.get("time").and_then(parse_timestamp).or(ctx.block_time),
        block_number: ctx.block_number,
        liquidation: fill
            .get("liquidation")
            .and_then(Value::as_object)
            .map(liquidation_info),
    }))
}

fn liquidation_info(obj: &Map<String, Value>) -> LiquidationInfo {
    LiquidationInfo {
        liquidated_user: text(obj.get("liquidatedUser")).map(|u| u.to_lowercase()),
        mark_px: text(obj.get("markPx")),
        method: text(obj.get("method")),
    }
}

/// Wire text of a string or number field. Empty strings count as absent.
fn text(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) => {
            let s = s.trim();
            (!s.is_empty()).then(|| s.to_string())
        }
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn as_u64(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Unix milliseconds (number or numeric string) or an ISO-8601 string.
/// ISO strings without an offset are taken as UTC.
pub fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f as i64))
            .and_then(DateTime::from_timestamp_millis),
        Value::String(s) => {
            let s = s.trim();
            if let Ok(ms) = s.parse::<i64>() {
                return DateTime::from_timestamp_millis(ms);
            }
            DateTime::parse_from_rfc3339(s)
                .map(|dt| dt.with_timezone(&Utc))
                .ok()
                .or_else(|| {
                    NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f")
                        .ok()
                        .map(|naive| naive.and_utc())
                })
        }
        _ => None,
    }
}

/// Parse a numeric wire value as a decimal.
///
/// A missing value is zero. A value that is present but not a number is a
/// [`ParseWarning`]; callers treat the field as zero and keep going.
pub fn parse_decimal(field: &'static str, raw: Option<&str>) -> Result<Decimal, ParseWarning> {
    let Some(raw) = raw else {
        return Ok(Decimal::ZERO);
    };
    let trimmed = raw.trim();
    Decimal::from_str(trimmed)
        .or_else(|_| Decimal::from_scientific(trimmed))
        .map_err(|_| ParseWarning {
            field,
            raw: raw.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;
    use serde_json::json;

    fn decode(value: Value, group_by: GroupBy) -> DecodedBlock {
        decode_payload(value.to_string().as_bytes(), group_by).expect("payload decodes")
    }

    fn fill(builder: Option<&str>, hash: &str, sz: &str) -> Value {
        let mut fill = json!({
            "coin": "ETH",
            "px": "2000.5",
            "sz": sz,
            "side": "B",
            "time": 1_700_000_000_000_i64,
            "hash": hash,
            "fee": "0.3",
            "builderFee": "0.05",
            "feeToken": "USDC",
            "closedPnl": "-1.5",
        });
        if let Some(b) = builder {
            fill["builder"] = json!(b);
        }
        fill
    }

    // ── shapes ────────────────────────────────────────────────────

    #[test]
    fn block_with_pairs() {
        let payload = json!({
            "block_number": 812_345,
            "block_time": "2024-01-01T00:00:00Z",
            "events": [
                ["0xAAA", fill(Some("0xBuilder"), "0xh1", "1")],
                ["0xBBB", fill(Some("0xbuilder"), "0xh2", "2")],
            ]
        });
        let block = decode(payload, GroupBy::Builder);
        assert_eq!(block.block_number, Some(812_345));
        assert_eq!(block.events.len(), 2);
        assert_eq!(block.skipped, 0);
        assert_eq!(block.invalid, 0);

        let first = &block.events[0];
        assert_eq!(first.key, "0xbuilder");
        assert_eq!(first.participant, "0xaaa");
        assert_eq!(first.id.as_str(), "0xh1:0xaaa:1");
        assert_eq!(first.price.as_deref(), Some("2000.5"));
        assert_eq!(first.fee.as_deref(), Some("0.05"));
        assert_eq!(first.block_number, Some(812_345));
        assert!(!first.is_liquidation());
    }

    #[test]
    fn height_and_fills_keys() {
        let payload = json!({
            "height": "42",
            "fills": [["0xa", fill(Some("0xb"), "0xh", "1")]]
        });
        let block = decode(payload, GroupBy::Builder);
        assert_eq!(block.block_number, Some(42));
        assert_eq!(block.events.len(), 1);
    }

    #[test]
    fn empty_or_null_events_fall_back_to_fills() {
        let pair = json!(["0xa", fill(Some("0xb"), "0xh", "1")]);
        for events in [Value::Null, json!([])] {
            let block = decode(json!({"events": events, "fills": [pair.clone()]}), GroupBy::Builder);
            assert_eq!(block.events.len(), 1);
        }

        let block = decode(json!({"block_number": 3, "events": []}), GroupBy::Builder);
        assert!(block.events.is_empty());
        assert_eq!(block.block_number, Some(3));
    }

    #[test]
    fn single_pair_payload() {
        let block = decode(json!(["0xUser", fill(Some("0xb"), "0xh", "3")]), GroupBy::User);
        assert_eq!(block.block_number, None);
        assert_eq!(block.events.len(), 1);
        assert_eq!(block.events[0].key, "0xuser");
        assert_eq!(block.events[0].fee.as_deref(), Some("0.3"));
    }

    #[test]
    fn array_of_pairs_payload() {
        let payload = json!([
            ["0xa", fill(Some("0xb"), "0xh1", "1")],
            ["0xc", fill(Some("0xb"), "0xh2", "1")],
        ]);
        let block = decode(payload, GroupBy::Builder);
        assert_eq!(block.events.len(), 2);
    }

    #[test]
    fn fill_object_with_user_field() {
        let mut entry = fill(Some("0xb"), "0xh", "1");
        entry["user"] = json!("0xDEF");
        let block = decode(json!({"events": [entry]}), GroupBy::User);
        assert_eq!(block.events.len(), 1);
        assert_eq!(block.events[0].participant, "0xdef");
    }

    #[test]
    fn group_by_coin() {
        let block = decode(json!(["0xa", fill(None, "0xh", "1")]), GroupBy::Coin);
        assert_eq!(block.events[0].key, "ETH");
    }

    #[test]
    fn invalid_json_is_error() {
        let err = decode_payload(b"{not json", GroupBy::Builder).unwrap_err();
        assert!(matches!(err, DecodeError::InvalidJson(_)));
    }

    #[test]
    fn scalar_is_error() {
        let err = decode_payload(b"42", GroupBy::Builder).unwrap_err();
        assert!(matches!(err, DecodeError::UnexpectedShape(_)));
    }

    #[test]
    fn object_without_events_is_error() {
        let err = decode_payload(br#"{"block_number": 1}"#, GroupBy::Builder).unwrap_err();
        assert!(matches!(err, DecodeError::UnexpectedShape(_)));
    }

    // ── per-fill extraction ───────────────────────────────────────

    #[test]
    fn fills_without_builder_are_skipped() {
        let payload = json!({
            "events": [
                ["0xa", fill(None, "0xh1", "1")],
                ["0xa", fill(Some("0xb"), "0xh2", "1")],
            ]
        });
        let block = decode(payload, GroupBy::Builder);
        assert_eq!(block.events.len(), 1);
        assert_eq!(block.skipped, 1);
    }

    #[test]
    fn tid_stands_in_for_missing_hash() {
        let mut entry = fill(Some("0xb"), "", "1");
        entry["tid"] = json!(987_654);
        let block = decode(json!(["0xa", entry]), GroupBy::Builder);
        assert_eq!(block.events[0].id.as_str(), "987654:0xa:1");
    }

    #[test]
    fn fill_without_identifier_does_not_drop_siblings() {
        let mut no_id = fill(Some("0xb"), "", "1");
        no_id.as_object_mut().unwrap().remove("hash");
        let payload = json!({
            "events": [
                ["0xa", no_id],
                "garbage",
                ["0xa", fill(Some("0xb"), "0xh2", "1")],
            ]
        });
        let block = decode(payload, GroupBy::Builder);
        assert_eq!(block.events.len(), 1);
        assert_eq!(block.invalid, 2);
    }

    #[test]
    fn numeric_fields_as_json_numbers() {
        let entry = json!({
            "builder": "0xb", "hash": "0xh", "px": 101.25, "sz": 2, "builderFee": 0.1,
            "feeToken": "USDC"
        });
        let block = decode(json!(["0xa", entry]), GroupBy::Builder);
        let event = &block.events[0];
        assert_eq!(event.price.as_deref(), Some("101.25"));
        assert_eq!(event.size.as_deref(), Some("2"));
        assert_eq!(event.id.as_str(), "0xh:0xa:2");
    }

    #[test]
    fn liquidation_object_marks_event() {
        let mut entry = fill(None, "0xh", "5");
        entry["dir"] = json!("Close Long");
        entry["liquidation"] = json!({
            "liquidatedUser": "0xAAA",
            "markPx": "1999.0",
            "method": "market"
        });
        let block = decode(json!(["0xaaa", entry]), GroupBy::User);
        let liq = block.events[0].liquidation.as_ref().expect("liquidation info");
        assert_eq!(liq.liquidated_user.as_deref(), Some("0xaaa"));
        assert_eq!(liq.mark_px.as_deref(), Some("1999.0"));
        assert_eq!(liq.method.as_deref(), Some("market"));
    }

    #[test]
    fn null_liquidation_is_not_liquidation() {
        let mut entry = fill(None, "0xh", "5");
        entry["liquidation"] = Value::Null;
        let block = decode(json!(["0xaaa", entry]), GroupBy::User);
        assert!(!block.events[0].is_liquidation());
    }

    #[test]
    fn fill_time_wins_over_block_time() {
        let mut untimed = fill(Some("0xb"), "0xh2", "1");
        untimed.as_object_mut().unwrap().remove("time");
        let payload = json!({
            "block_time": "2024-01-01T00:00:00",
            "events": [["0xa", fill(Some("0xb"), "0xh1", "1")], ["0xa", untimed]]
        });
        let block = decode(payload, GroupBy::Builder);
        assert_eq!(
            block.events[0].timestamp,
            DateTime::from_timestamp_millis(1_700_000_000_000)
        );
        assert_eq!(
            block.events[1].timestamp,
            Some(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap())
        );
    }

    // ── helpers ───────────────────────────────────────────────────

    #[test]
    fn timestamp_formats() {
        let expected = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        assert_eq!(parse_timestamp(&json!("2024-01-01T00:00:00Z")), Some(expected));
        assert_eq!(parse_timestamp(&json!("2024-01-01T02:00:00+02:00")), Some(expected));
        assert_eq!(parse_timestamp(&json!(1_704_067_200_000_i64)), Some(expected));
        assert_eq!(parse_timestamp(&json!("1704067200000")), Some(expected));
        assert_eq!(parse_timestamp(&json!("yesterday")), None);
        assert_eq!(parse_timestamp(&json!(true)), None);
    }

    #[test]
    fn decimal_parsing() {
        assert_eq!(parse_decimal("px", Some("100")), Ok(dec!(100)));
        assert_eq!(parse_decimal("px", Some(" 0.5 ")), Ok(dec!(0.5)));
        assert_eq!(parse_decimal("px", Some("1e-5")), Ok(dec!(0.00001)));
        assert_eq!(parse_decimal("px", None), Ok(Decimal::ZERO));
        assert_eq!(
            parse_decimal("sz", Some("abc")),
            Err(ParseWarning {
                field: "sz",
                raw: "abc".to_string()
            })
        );
    }
}
