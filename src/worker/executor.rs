//! Task execution seam.
//!
//! The framework treats payloads as opaque bytes; a [`TaskExecutor`]
//! gives them meaning. Embedders implement the trait; the shipped `tm
//! worker` binary uses [`BuiltinExecutor`], a tiny text-command
//! interpreter that is enough to smoke-test a pool end to end.

use std::collections::HashMap;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use thiserror::Error;

use crate::rng::{SeedError, StreamSeed};

/// Per-daemon execution state: the assigned RNG stream and scratch
/// space that survives between tasks unless `cleanup` is set.
pub struct TaskContext {
    rng: StdRng,
    scratch: HashMap<String, Vec<u8>>,
}

impl TaskContext {
    pub fn new(seed: Option<StreamSeed>) -> Result<Self, SeedError> {
        let rng = match seed {
            Some(seed) => {
                seed.validate()?;
                StdRng::from_seed(seed.to_rng_seed())
            }
            None => StdRng::from_seed(rand::random()),
        };
        Ok(Self {
            rng,
            scratch: HashMap::new(),
        })
    }

    pub fn rng(&mut self) -> &mut StdRng {
        &mut self.rng
    }

    pub fn scratch_put(&mut self, key: &str, value: Vec<u8>) {
        self.scratch.insert(key.to_string(), value);
    }

    pub fn scratch_get(&self, key: &str) -> Option<&[u8]> {
        self.scratch.get(key).map(Vec::as_slice)
    }

    pub(crate) fn clear_scratch(&mut self) {
        self.scratch.clear();
    }
}

/// A task produced an error object. The payload reaches the collecting
/// client untouched.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("{0}")]
pub struct TaskFailure(pub String);

impl TaskFailure {
    pub fn into_payload(self) -> Vec<u8> {
        self.0.into_bytes()
    }
}

pub trait TaskExecutor: Send {
    /// Called once before the first task with the pool's preload list.
    fn preload(&mut self, _capabilities: &[String]) {}

    fn execute(&mut self, ctx: &mut TaskContext, payload: &[u8]) -> Result<Vec<u8>, TaskFailure>;

    /// Called between tasks when the `cleanup` option is set.
    fn cleanup(&mut self) {}
}

impl<T: TaskExecutor + ?Sized> TaskExecutor for &mut T {
    fn preload(&mut self, capabilities: &[String]) {
        (**self).preload(capabilities);
    }

    fn execute(&mut self, ctx: &mut TaskContext, payload: &[u8]) -> Result<Vec<u8>, TaskFailure> {
        (**self).execute(ctx, payload)
    }

    fn cleanup(&mut self) {
        (**self).cleanup();
    }
}

/// The reference executor: utf-8 commands, one per task.
///
/// `pid` / `tag` / `echo <bytes>` / `sleep <ms>` / `random` /
/// `note <key> <bytes>` / `recall <key>` / `fail <msg>` / `panic <msg>`.
pub struct BuiltinExecutor {
    tag: String,
}

impl BuiltinExecutor {
    pub fn new() -> Self {
        Self {
            tag: std::process::id().to_string(),
        }
    }

    /// Distinguishes workers sharing one process (thread-hosted pools).
    pub fn with_tag(tag: impl Into<String>) -> Self {
        Self { tag: tag.into() }
    }
}

impl Default for BuiltinExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskExecutor for BuiltinExecutor {
    fn execute(&mut self, ctx: &mut TaskContext, payload: &[u8]) -> Result<Vec<u8>, TaskFailure> {
        let text = std::str::from_utf8(payload)
            .map_err(|_| TaskFailure("payload is not utf-8".into()))?;
        let (op, rest) = match text.split_once(' ') {
            Some((op, rest)) => (op, rest),
            None => (text, ""),
        };

        match op {
            "pid" => Ok(std::process::id().to_string().into_bytes()),
            "tag" => Ok(self.tag.clone().into_bytes()),
            "echo" => Ok(rest.as_bytes().to_vec()),
            "sleep" => {
                let ms: u64 = rest
                    .trim()
                    .parse()
                    .map_err(|_| TaskFailure(format!("bad sleep duration {rest:?}")))?;
                std::thread::sleep(Duration::from_millis(ms));
                Ok(format!("slept {ms}").into_bytes())
            }
            "random" => Ok(ctx.rng().random::<u64>().to_string().into_bytes()),
            "note" => {
                let (key, value) = rest
                    .split_once(' ')
                    .ok_or_else(|| TaskFailure("note needs a key and a value".into()))?;
                ctx.scratch_put(key, value.as_bytes().to_vec());
                Ok(Vec::new())
            }
            "recall" => ctx
                .scratch_get(rest.trim())
                .map(<[u8]>::to_vec)
                .ok_or_else(|| TaskFailure(format!("nothing noted under {rest:?}"))),
            "fail" => Err(TaskFailure(rest.to_string())),
            "panic" => panic!("{rest}"),
            other => Err(TaskFailure(format!("unknown op {other:?}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> TaskContext {
        TaskContext::new(Some(StreamSeed([1, 2, 3, 4, 5, 6]))).unwrap()
    }

    #[test]
    fn echo_and_tag() {
        let mut exec = BuiltinExecutor::with_tag("w1");
        assert_eq!(
            exec.execute(&mut ctx(), b"echo hello").unwrap(),
            b"hello".to_vec()
        );
        assert_eq!(exec.execute(&mut ctx(), b"tag").unwrap(), b"w1".to_vec());
    }

    #[test]
    fn random_is_deterministic_per_stream() {
        let mut exec = BuiltinExecutor::new();
        let a = exec.execute(&mut ctx(), b"random").unwrap();
        let b = exec.execute(&mut ctx(), b"random").unwrap();
        // Same seed vector, fresh context: same first draw.
        assert_eq!(a, b);
    }

    #[test]
    fn scratch_survives_until_cleared() {
        let mut exec = BuiltinExecutor::new();
        let mut ctx = ctx();
        exec.execute(&mut ctx, b"note k v").unwrap();
        assert_eq!(exec.execute(&mut ctx, b"recall k").unwrap(), b"v".to_vec());

        ctx.clear_scratch();
        assert!(exec.execute(&mut ctx, b"recall k").is_err());
    }

    #[test]
    fn failures_carry_their_message() {
        let mut exec = BuiltinExecutor::new();
        let err = exec.execute(&mut ctx(), b"fail out of cheese").unwrap_err();
        assert_eq!(err.into_payload(), b"out of cheese".to_vec());

        assert!(exec.execute(&mut ctx(), b"frobnicate").is_err());
    }
}
