//! Serialization hooks for otherwise non-transportable values.
//!
//! Payloads are opaque to the framework, with one escape hatch: a
//! payload may open with a reference marker naming a class tag, in
//! which case the registered hook for that tag is applied on each side.
//! Hook functions cannot cross the process boundary — the configuration
//! handshake forwards only the `{class_tag, vectorized}` records, and a
//! worker must register matching hooks before serving tasks.

use std::borrow::Cow;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// First byte of a payload that routes through a hook.
pub const HOOK_MARKER: u8 = 0x1d;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum HookError {
    #[error("no serialization hook registered for class tag {0:?}")]
    UnknownTag(String),
    #[error("malformed hooked payload")]
    Malformed,
    #[error("hook decode failed: {0}")]
    Decode(String),
}

/// The transportable half of a hook, exchanged in the handshake.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HookSpec {
    pub class_tag: String,
    pub vectorized: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct SerialConfig {
    pub hooks: Vec<HookSpec>,
}

pub type EncodeFn = Arc<dyn Fn(&[u8]) -> Vec<u8> + Send + Sync>;
pub type DecodeFn = Arc<dyn Fn(&[u8]) -> Result<Vec<u8>, HookError> + Send + Sync>;

#[derive(Clone)]
pub struct SerialHook {
    pub class_tag: String,
    /// Hook is applied element-wise to a batch rather than per value.
    pub vectorized: bool,
    pub encode: EncodeFn,
    pub decode: DecodeFn,
}

/// Ordered hook registry consulted by the framing layer.
#[derive(Clone, Default)]
pub struct Registry {
    hooks: Vec<SerialHook>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a hook. A later registration for the same tag wins.
    pub fn register(&mut self, hook: SerialHook) {
        self.hooks.retain(|h| h.class_tag != hook.class_tag);
        self.hooks.push(hook);
    }

    pub fn lookup(&self, class_tag: &str) -> Option<&SerialHook> {
        self.hooks.iter().find(|h| h.class_tag == class_tag)
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }

    /// The transportable view, forwarded in the handshake.
    pub fn config(&self) -> SerialConfig {
        SerialConfig {
            hooks: self
                .hooks
                .iter()
                .map(|h| HookSpec {
                    class_tag: h.class_tag.clone(),
                    vectorized: h.vectorized,
                })
                .collect(),
        }
    }

    /// Frame `value` as a hooked payload for `class_tag`.
    pub fn encode_tagged(&self, class_tag: &str, value: &[u8]) -> Result<Vec<u8>, HookError> {
        let hook = self
            .lookup(class_tag)
            .ok_or_else(|| HookError::UnknownTag(class_tag.to_string()))?;
        let encoded = (hook.encode)(value);

        let tag = class_tag.as_bytes();
        let mut out = Vec::with_capacity(2 + tag.len() + encoded.len());
        out.push(HOOK_MARKER);
        out.push(u8::try_from(tag.len()).map_err(|_| HookError::Malformed)?);
        out.extend_from_slice(tag);
        out.extend_from_slice(&encoded);
        Ok(out)
    }

    /// Resolve a payload: plain payloads pass through untouched, hooked
    /// payloads are decoded by the registered hook.
    pub fn decode_payload<'a>(&self, payload: &'a [u8]) -> Result<Cow<'a, [u8]>, HookError> {
        match payload.first() {
            Some(&HOOK_MARKER) => {}
            _ => return Ok(Cow::Borrowed(payload)),
        }
        let tag_len = *payload.get(1).ok_or(HookError::Malformed)? as usize;
        let tag_end = 2 + tag_len;
        let tag = payload.get(2..tag_end).ok_or(HookError::Malformed)?;
        let tag = std::str::from_utf8(tag).map_err(|_| HookError::Malformed)?;
        let hook = self
            .lookup(tag)
            .ok_or_else(|| HookError::UnknownTag(tag.to_string()))?;
        let body = &payload[tag_end..];
        (hook.decode)(body).map(Cow::Owned)
    }
}
