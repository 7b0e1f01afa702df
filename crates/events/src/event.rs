use serde::Serialize;
use serde::de::DeserializeOwned;

/// A typed event payload.
///
/// Stored events carry opaque bytes plus a payload type name; this trait ties
/// a Rust type to that name and to its `serde_json` encoding.
pub trait EventPayload: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Stable payload type identifier (e.g. "account.deposited").
    const PAYLOAD_TYPE: &'static str;

    fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    fn decode(payload: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(payload)
    }
}
