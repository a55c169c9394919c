//! Feedback service client.
//!
//! The Feedback service is a one-shot stream: connect, read fixed 38-byte
//! tuples of expired device tokens until the peer closes, hand the list to
//! the caller. There is no request to send. Apple removes an entry once it
//! has been reported, so the caller decides the polling cadence and must
//! re-check registration timestamps before acting on an entry.

use bytes::BytesMut;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::time::timeout;
use tracing::{debug, info};

use crate::net::{Connect, TransportError};
use crate::wire::{self, FEEDBACK_ENTRY_LENGTH, FeedbackEntry, WireError};
use crate::worker::RESPONSE_READ_WINDOW;

/// One expired-device entry reported by the Feedback service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedbackDevice {
    /// When the service determined the token was no longer reachable.
    pub timestamp: DateTime<Utc>,
    /// The expired device token, as 64 hex characters.
    #[serde(rename = "deviceToken")]
    pub device_token: String,
}

impl From<FeedbackEntry> for FeedbackDevice {
    fn from(entry: FeedbackEntry) -> Self {
        Self {
            timestamp: DateTime::from_timestamp(i64::from(entry.timestamp), 0)
                .unwrap_or_default(),
            device_token: entry.device_token,
        }
    }
}

/// Everything one fetch returned.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedbackResponse {
    /// Devices reported unreachable, in stream order.
    pub devices: Vec<FeedbackDevice>,
}

/// Errors from a feedback fetch.
///
/// The record-level variants carry the entries decoded before the failure,
/// so a caller can still act on the partial list.
#[derive(Debug, Error)]
pub enum FeedbackError {
    /// Connecting to the feedback gateway failed.
    #[error(transparent)]
    Connect(#[from] TransportError),

    /// Reading the stream failed mid-way.
    #[error("error reading feedback stream: {source}")]
    Read {
        /// Underlying IO error.
        source: std::io::Error,
        /// Entries decoded before the failure.
        partial: Vec<FeedbackDevice>,
    },

    /// The stream carried a short or misaligned record.
    #[error("{source}")]
    Decode {
        /// The wire-level failure.
        source: WireError,
        /// Entries decoded before the failure.
        partial: Vec<FeedbackDevice>,
    },
}

/// One-shot client for the Feedback service.
pub struct FeedbackClient<C> {
    connector: C,
}

impl<C: Connect> FeedbackClient<C> {
    /// Creates a client that dials through `connector`.
    #[must_use]
    pub fn new(connector: C) -> Self {
        Self { connector }
    }

    /// Connects and drains the expired-device stream.
    ///
    /// # Errors
    ///
    /// Returns a [`FeedbackError`] when the connection cannot be
    /// established or the stream is malformed; record-level failures carry
    /// the entries decoded so far.
    pub async fn fetch(&self) -> Result<FeedbackResponse, FeedbackError> {
        let mut conn = self.connector.connect().await?;
        let response = read_entries(&mut conn).await?;
        info!(devices = response.devices.len(), "feedback service drained");
        Ok(response)
    }
}

/// Reads 38-byte tuples from `stream` until a clean end.
///
/// A clean end is EOF at a record boundary, or a 500 ms read deadline with
/// no buffered partial record. EOF or a deadline mid-record means the
/// stream is misaligned and is reported as an unrecognized entry.
pub(crate) async fn read_entries<S>(stream: &mut S) -> Result<FeedbackResponse, FeedbackError>
where
    S: AsyncRead + Unpin,
{
    let mut devices = Vec::new();
    let mut buf = BytesMut::with_capacity(FEEDBACK_ENTRY_LENGTH * 16);

    loop {
        while buf.len() >= FEEDBACK_ENTRY_LENGTH {
            let record = buf.split_to(FEEDBACK_ENTRY_LENGTH);
            match wire::decode_feedback_entry(&record) {
                Ok(entry) => {
                    debug!(token = %entry.device_token, "feedback entry");
                    devices.push(FeedbackDevice::from(entry));
                }
                Err(source) => {
                    return Err(FeedbackError::Decode {
                        source,
                        partial: devices,
                    });
                }
            }
        }

        match timeout(RESPONSE_READ_WINDOW, stream.read_buf(&mut buf)).await {
            // Deadline with nothing buffered: the service is done talking.
            Err(_elapsed) if buf.is_empty() => break,
            // Clean EOF at a record boundary.
            Ok(Ok(0)) if buf.is_empty() => break,
            // Ends mid-record: misaligned stream.
            Err(_elapsed) => {
                return Err(FeedbackError::Decode {
                    source: WireError::UnrecognizedFeedbackEntry,
                    partial: devices,
                });
            }
            Ok(Ok(0)) => {
                return Err(FeedbackError::Decode {
                    source: WireError::UnrecognizedFeedbackEntry,
                    partial: devices,
                });
            }
            Ok(Ok(_)) => {}
            Ok(Err(source)) => {
                return Err(FeedbackError::Read {
                    source,
                    partial: devices,
                });
            }
        }
    }

    Ok(FeedbackResponse { devices })
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncWriteExt, duplex};

    use super::*;

    fn record(timestamp: u32, fill: u8) -> Vec<u8> {
        let mut data = Vec::with_capacity(FEEDBACK_ENTRY_LENGTH);
        data.extend_from_slice(&timestamp.to_be_bytes());
        data.extend_from_slice(&32u16.to_be_bytes());
        data.extend_from_slice(&[fill; 32]);
        data
    }

    #[tokio::test(start_paused = true)]
    async fn test_two_records_then_eof() {
        let (mut client, mut server) = duplex(1024);

        server.write_all(&record(1, 0x00)).await.unwrap();
        server.write_all(&record(2, 0xFF)).await.unwrap();
        drop(server);

        let response = read_entries(&mut client).await.unwrap();
        assert_eq!(response.devices.len(), 2);
        assert_eq!(response.devices[0].device_token, "00".repeat(32));
        assert_eq!(response.devices[0].timestamp.timestamp(), 1);
        assert_eq!(response.devices[1].device_token, "ff".repeat(32));
        assert_eq!(response.devices[1].timestamp.timestamp(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_stream() {
        let (mut client, server) = duplex(1024);
        drop(server);

        let response = read_entries(&mut client).await.unwrap();
        assert!(response.devices.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_deadline_is_a_clean_end() {
        let (mut client, mut server) = duplex(1024);

        server.write_all(&record(7, 0xAB)).await.unwrap();
        // Keep the connection open but silent; the deadline ends the scan.
        let response = read_entries(&mut client).await.unwrap();
        assert_eq!(response.devices.len(), 1);
        drop(server);
    }

    #[tokio::test(start_paused = true)]
    async fn test_truncated_record_returns_partial_list() {
        let (mut client, mut server) = duplex(1024);

        server.write_all(&record(1, 0x01)).await.unwrap();
        server.write_all(&[0, 0, 0, 9, 0, 32, 0xEE]).await.unwrap();
        drop(server);

        let err = read_entries(&mut client).await.unwrap_err();
        match err {
            FeedbackError::Decode { source, partial } => {
                assert_eq!(source, WireError::UnrecognizedFeedbackEntry);
                assert_eq!(partial.len(), 1);
                assert_eq!(partial[0].device_token, "01".repeat(32));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_bad_token_length_field_aborts_scan() {
        let (mut client, mut server) = duplex(1024);

        let mut bad = record(1, 0x02);
        bad[4] = 0;
        bad[5] = 31;
        server.write_all(&bad).await.unwrap();
        server.write_all(&record(2, 0x03)).await.unwrap();
        drop(server);

        let err = read_entries(&mut client).await.unwrap_err();
        match err {
            FeedbackError::Decode { partial, .. } => assert!(partial.is_empty()),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_response_json_shape() {
        let response = FeedbackResponse {
            devices: vec![FeedbackDevice {
                timestamp: DateTime::from_timestamp(1_445_416_351, 0).unwrap(),
                device_token: "b687baf21a5eb87c2977e113c0704b002067680f2101bbb4679fc366a9024fd4"
                    .to_string(),
            }],
        };

        let json = serde_json::to_value(&response).unwrap();
        assert!(json["devices"][0]["deviceToken"].is_string());
        assert!(json["devices"][0]["timestamp"].is_string());
    }
}
