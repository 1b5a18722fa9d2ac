//! Wire codec for publisher frames.
//!
//! Input is untrusted bytes. `decode` never fails: every structural
//! violation (broken JSON, wrong types, missing fields, unknown `op`,
//! out-of-range numbers) collapses into [`WireEnvelope::Fault`] with a
//! human-readable message.

use crate::error::FeedError;
use crate::types::{Signal, SignalSide};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq)]
pub enum WireEnvelope {
    Signal(Signal),
    SignalBatch(Vec<Signal>),
    Heartbeat { t: i64 },
    Fault { message: String },
}

#[derive(Debug, Deserialize)]
#[serde(tag = "op")]
enum RawEnvelope {
    #[serde(rename = "signal")]
    Signal { data: RawSignal },
    #[serde(rename = "signals")]
    Batch { data: Vec<RawSignal> },
    #[serde(rename = "ping")]
    Ping { t: i64 },
    #[serde(rename = "error")]
    Error { message: String },
}

#[derive(Debug, Deserialize)]
struct RawSignal {
    id: Option<String>,
    ts: i64,
    symbol: String,
    tf: Option<String>,
    side: Option<SignalSide>,
    price: Option<f64>,
    reason: Option<String>,
    score: Option<f64>,
}

impl TryFrom<RawSignal> for Signal {
    type Error = String;

    fn try_from(value: RawSignal) -> Result<Self, Self::Error> {
        if value.ts < 0 {
            return Err(format!("ts must be non-negative, got {}", value.ts));
        }

        let symbol = value.symbol.trim().to_string();
        if symbol.is_empty() {
            return Err("symbol must be non-empty".to_string());
        }

        if let Some(price) = value.price {
            if !price.is_finite() {
                return Err("price must be finite".to_string());
            }
        }
        if let Some(score) = value.score {
            if !score.is_finite() {
                return Err("score must be finite".to_string());
            }
        }

        Ok(Self {
            id: value.id,
            ts: value.ts,
            symbol,
            tf: value.tf,
            side: value.side,
            price: value.price,
            reason: value.reason,
            score: value.score,
        })
    }
}

pub fn decode(payload: &mut [u8]) -> WireEnvelope {
    let raw: RawEnvelope = match simd_json::serde::from_slice(payload) {
        Ok(raw) => raw,
        Err(error) => {
            return WireEnvelope::Fault {
                message: format!("malformed envelope: {error}"),
            }
        }
    };

    match raw {
        RawEnvelope::Signal { data } => match data.try_into() {
            Ok(signal) => WireEnvelope::Signal(signal),
            Err(message) => WireEnvelope::Fault {
                message: format!("invalid signal: {message}"),
            },
        },
        RawEnvelope::Batch { data } => {
            let mut signals = Vec::with_capacity(data.len());
            for raw_signal in data {
                match raw_signal.try_into() {
                    Ok(signal) => signals.push(signal),
                    Err(message) => {
                        return WireEnvelope::Fault {
                            message: format!("invalid signal in batch: {message}"),
                        }
                    }
                }
            }
            WireEnvelope::SignalBatch(signals)
        }
        RawEnvelope::Ping { t } => {
            if t < 0 {
                WireEnvelope::Fault {
                    message: format!("ping t must be non-negative, got {t}"),
                }
            } else {
                WireEnvelope::Heartbeat { t }
            }
        }
        RawEnvelope::Error { message } => WireEnvelope::Fault { message },
    }
}

#[derive(Debug, Serialize)]
struct SubscribeFrame<'a> {
    op: &'static str,
    channel: &'a str,
}

/// Handshake frame sent once per attempt, identical logical content on
/// every transport kind.
pub fn encode_subscribe(channel: &str) -> Result<String, FeedError> {
    Ok(simd_json::serde::to_string(&SubscribeFrame {
        op: "subscribe",
        channel,
    })?)
}

#[derive(Debug, Serialize)]
struct PingFrame {
    op: &'static str,
    t: i64,
}

pub fn encode_ping(t: i64) -> Result<String, FeedError> {
    Ok(simd_json::serde::to_string(&PingFrame { op: "ping", t })?)
}
