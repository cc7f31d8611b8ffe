use crate::aggregator::TimestampedStat;
use crate::error::DeliveryError;
use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

/// Output encoding of a sink.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutputFormat {
    #[default]
    #[serde(rename = "structured-json", alias = "json")]
    StructuredJson,
    #[serde(rename = "plain-text", alias = "txt")]
    PlainText,
}

impl OutputFormat {
    /// One stat per line
    pub fn encode(&self, stat: &TimestampedStat) -> Result<Bytes, DeliveryError> {
        let mut buf = BytesMut::with_capacity(256);
        match self {
            OutputFormat::StructuredJson => {
                let json = serde_json::to_vec(stat)
                    .map_err(|e| DeliveryError::Encode(e.to_string()))?;
                buf.extend_from_slice(&json);
            }
            OutputFormat::PlainText => {
                buf.extend_from_slice(stat.to_string().as_bytes());
            }
        }
        buf.put_u8(b'\n');
        Ok(buf.freeze())
    }
}
