use base64::{engine::general_purpose::STANDARD, Engine};
use serde::Deserialize;
use std::{
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};
use tokio::time::sleep;

use crate::types::FileDescriptor;

const SUCCESS_CODE: &str = "SCC";

#[derive(Debug, Deserialize)]
struct InventoryPayload {
    code: Option<String>,
    #[serde(default)]
    data: Vec<InventoryEntry>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InventoryEntry {
    pub file_name: Option<String>,
    #[serde(default, deserialize_with = "lenient_u32")]
    pub seq: Option<u32>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub board_seq: Option<String>,
}

impl InventoryEntry {
    pub fn into_descriptor(self, record_id: &str) -> FileDescriptor {
        FileDescriptor {
            file_name: self.file_name.unwrap_or_else(|| "unknown".into()),
            file_sequence: self.seq.unwrap_or(1),
            owning_record_id: self.board_seq.unwrap_or_else(|| record_id.into()),
        }
    }
}

// the endpoint is not consistent about numbers vs numeric strings
fn lenient_u32<'de, D: serde::Deserializer<'de>>(d: D) -> Result<Option<u32>, D::Error> {
    let v = Option::<serde_json::Value>::deserialize(d)?;
    Ok(match v {
        Some(serde_json::Value::Number(n)) => n.as_u64().and_then(|n| u32::try_from(n).ok()),
        Some(serde_json::Value::String(s)) => s.trim().parse().ok(),
        _ => None,
    })
}

fn lenient_string<'de, D: serde::Deserializer<'de>>(d: D) -> Result<Option<String>, D::Error> {
    let v = Option::<serde_json::Value>::deserialize(d)?;
    Ok(match v {
        Some(serde_json::Value::Number(n)) => Some(n.to_string()),
        Some(serde_json::Value::String(s)) if !s.trim().is_empty() => Some(s.trim().into()),
        _ => None,
    })
}

/// Decodes a file inventory body. `None` unless the body is a successful
/// inventory response.
pub fn decode_inventory(body: &str) -> Option<Vec<InventoryEntry>> {
    let payload: InventoryPayload = serde_json::from_str(body).ok()?;
    match payload.code.as_deref() {
        Some(SUCCESS_CODE) => Some(payload.data),
        _ => None,
    }
}

/// Single-slot mailbox for the file inventory of one detail view.
///
/// A fresh slot is created for every record visit; the response observer
/// writes into it and the driver drains it.
#[derive(Debug, Clone, Default)]
pub struct CaptureSlot {
    inner: Arc<Mutex<Option<Vec<InventoryEntry>>>>,
}

impl CaptureSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Offers a raw response body. Returns true if it was a valid inventory.
    pub fn offer(&self, body: &str, base64_encoded: bool) -> bool {
        let decoded;
        let text = if base64_encoded {
            decoded = match STANDARD.decode(body) {
                Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
                Err(_) => return false,
            };
            decoded.as_str()
        } else {
            body
        };

        match decode_inventory(text) {
            Some(entries) => {
                self.fill(entries);
                true
            }
            None => false,
        }
    }

    pub fn fill(&self, entries: Vec<InventoryEntry>) {
        if let Ok(mut slot) = self.inner.lock() {
            *slot = Some(entries);
        }
    }

    pub fn take(&self) -> Option<Vec<InventoryEntry>> {
        self.inner.lock().ok().and_then(|mut slot| slot.take())
    }

    pub fn is_filled(&self) -> bool {
        self.inner.lock().map(|s| s.is_some()).unwrap_or(false)
    }
}

/// Polls `slot` every `poll` until it is filled or `max_wait` elapses. An
/// empty list means nothing arrived, which callers treat as "no files".
pub async fn await_file_list(
    slot: &CaptureSlot,
    record_id: &str,
    max_wait: Duration,
    poll: Duration,
) -> Vec<FileDescriptor> {
    let started = Instant::now();
    loop {
        if let Some(entries) = slot.take() {
            return entries
                .into_iter()
                .map(|e| e.into_descriptor(record_id))
                .collect();
        }
        if started.elapsed() >= max_wait {
            debug!("no file inventory for {} within {:?}", record_id, max_wait);
            return vec![];
        }
        sleep(poll).await;
    }
}

#[cfg(test)]
mod test {
    use super::*;

    macro_rules! aw {
        ($e:expr) => {
            tokio_test::block_on($e)
        };
    }

    const BODY: &str = r#"{"code":"SCC","data":[
        {"fileName":"장기수선계획서.xlsx","seq":1,"boardSeq":128980},
        {"fileName":"plan.pdf","seq":"2"},
        {"seq":3,"boardSeq":""}
    ]}"#;

    #[test]
    fn decodes_successful_inventory() {
        let entries = decode_inventory(BODY).unwrap();
        let files = entries
            .into_iter()
            .map(|e| e.into_descriptor("555"))
            .collect::<Vec<_>>();
        assert_eq!(
            files[0],
            FileDescriptor {
                file_name: "장기수선계획서.xlsx".into(),
                file_sequence: 1,
                owning_record_id: "128980".into(),
            }
        );
        assert_eq!(files[1].file_sequence, 2);
        assert_eq!(files[1].owning_record_id, "555");
        assert_eq!(files[2].file_name, "unknown");
        assert_eq!(files[2].owning_record_id, "555");
    }

    #[test]
    fn rejects_failed_or_malformed_bodies() {
        assert!(decode_inventory(r#"{"code":"ERR","data":[]}"#).is_none());
        assert!(decode_inventory("<html>").is_none());
        assert_eq!(decode_inventory(r#"{"code":"SCC"}"#).unwrap().len(), 0);
    }

    #[test]
    fn offer_accepts_base64_bodies() {
        let slot = CaptureSlot::new();
        assert!(!slot.offer("not base64 !!", true));
        assert!(slot.offer(&STANDARD.encode(BODY), true));
        assert_eq!(slot.take().unwrap().len(), 3);
        assert!(slot.take().is_none());
    }

    #[test]
    fn await_returns_captured_files() {
        let slot = CaptureSlot::new();
        slot.offer(BODY, false);
        let files = aw!(await_file_list(
            &slot,
            "1",
            Duration::from_millis(50),
            Duration::from_millis(5)
        ));
        assert_eq!(files.len(), 3);
        assert!(!slot.is_filled());
    }

    #[test]
    fn await_times_out_to_empty() {
        let slot = CaptureSlot::new();
        let started = Instant::now();
        let files = aw!(await_file_list(
            &slot,
            "1",
            Duration::from_millis(40),
            Duration::from_millis(5)
        ));
        assert!(files.is_empty());
        assert!(started.elapsed() >= Duration::from_millis(40));
    }

    #[test]
    fn await_sees_late_arrivals() {
        let slot = CaptureSlot::new();
        let writer = slot.clone();
        let files = aw!(async {
            tokio::spawn(async move {
                sleep(Duration::from_millis(20)).await;
                writer.offer(BODY, false);
            });
            await_file_list(&slot, "1", Duration::from_secs(2), Duration::from_millis(5)).await
        });
        assert_eq!(files.len(), 3);
    }
}
