//! Process-wide handle registry: opaque ids for host bridges that cannot
//! hold the analyzer directly.
//!
//! Create/destroy on distinct handles may race freely; each analyzer carries
//! its own locks, so the registry mutex only guards the id map.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use tracing::info;

use crate::config::Options;
use crate::error::StreamError;
use crate::stream::RealtimeAnalyzer;
use crate::types::{HeartMetrics, QualityInfo};

/// Hard per-push cap at the bridge boundary; the analyzer additionally clamps
/// batches to ten seconds of samples.
pub const MAX_SAMPLES_PER_PUSH: usize = 1 << 20;

static REGISTRY: Lazy<Mutex<HashMap<u64, Arc<RealtimeAnalyzer>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));
static NEXT_ID: AtomicU64 = AtomicU64::new(1);

fn get(handle: u64) -> Option<Arc<RealtimeAnalyzer>> {
    REGISTRY.lock().get(&handle).cloned()
}

/// Validate options and register a new analyzer; returns an opaque id >= 1.
pub fn create(fs: f64, options: Options) -> Result<u64, StreamError> {
    let analyzer = RealtimeAnalyzer::new(fs, options)?;
    let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
    REGISTRY.lock().insert(id, Arc::new(analyzer));
    info!(handle = id, fs, "realtime analyzer created");
    Ok(id)
}

pub fn set_window_seconds(handle: u64, sec: f64) -> Result<(), StreamError> {
    if !sec.is_finite() || sec <= 0.0 {
        return Err(StreamError::InvalidWindowArg(sec));
    }
    let a = get(handle).ok_or(StreamError::InvalidHandlePush(handle))?;
    a.set_window_seconds(sec);
    Ok(())
}

pub fn set_update_interval_seconds(handle: u64, sec: f64) -> Result<(), StreamError> {
    if !sec.is_finite() || sec <= 0.0 {
        return Err(StreamError::InvalidWindowArg(sec));
    }
    let a = get(handle).ok_or(StreamError::InvalidHandlePush(handle))?;
    a.set_update_interval_seconds(sec);
    Ok(())
}

pub fn push(handle: u64, samples: &[f32]) -> Result<(), StreamError> {
    if samples.is_empty() {
        return Err(StreamError::InvalidBuffer("empty buffer"));
    }
    if samples.len() > MAX_SAMPLES_PER_PUSH {
        return Err(StreamError::InvalidBuffer("buffer too large"));
    }
    let a = get(handle).ok_or(StreamError::InvalidHandlePush(handle))?;
    a.push(samples);
    Ok(())
}

pub fn push_with_timestamps(handle: u64, samples: &[f32], timestamps: &[f64]) -> Result<(), StreamError> {
    if samples.is_empty() || timestamps.is_empty() {
        return Err(StreamError::InvalidBuffer("empty buffer"));
    }
    if samples.len() != timestamps.len() {
        return Err(StreamError::InvalidBuffer("sample/timestamp length mismatch"));
    }
    if samples.len() > MAX_SAMPLES_PER_PUSH {
        return Err(StreamError::InvalidBuffer("buffer too large"));
    }
    let a = get(handle).ok_or(StreamError::InvalidHandlePush(handle))?;
    a.push_with_timestamps(samples, timestamps);
    Ok(())
}

/// One metrics record when the update interval has elapsed, `Ok(None)` when
/// not ready.
pub fn poll(handle: u64) -> Result<Option<HeartMetrics>, StreamError> {
    let a = get(handle).ok_or(StreamError::InvalidHandlePoll(handle))?;
    Ok(a.poll())
}

pub fn quality(handle: u64) -> Result<QualityInfo, StreamError> {
    let a = get(handle).ok_or(StreamError::InvalidHandlePoll(handle))?;
    Ok(a.quality())
}

/// Release the analyzer and invalidate the id.
pub fn destroy(handle: u64) -> Result<(), StreamError> {
    let removed = REGISTRY.lock().remove(&handle);
    match removed {
        Some(_) => {
            info!(handle, "realtime analyzer destroyed");
            Ok(())
        }
        None => Err(StreamError::InvalidHandleDestroy(handle)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle_roundtrip() {
        let id = create(50.0, Options::default()).unwrap();
        assert!(id >= 1);
        push(id, &[0.0f32; 50]).unwrap();
        // not ready right away (0.5 s update interval, 1 s of data needed)
        let _ = poll(id).unwrap();
        destroy(id).unwrap();
        assert_eq!(destroy(id).unwrap_err().code(), "E121");
        assert_eq!(push(id, &[0.0f32; 10]).unwrap_err().code(), "E101");
        assert_eq!(poll(id).unwrap_err().code(), "E111");
    }

    #[test]
    fn create_validates_options() {
        let mut opt = Options::default();
        opt.welch.nfft = 7;
        let err = create(50.0, opt).unwrap_err();
        assert_eq!(err.code(), "E012");
    }

    #[test]
    fn push_rejects_bad_buffers() {
        let id = create(50.0, Options::default()).unwrap();
        assert_eq!(push(id, &[]).unwrap_err().code(), "E102");
        assert_eq!(
            push_with_timestamps(id, &[0.0; 3], &[0.0; 2]).unwrap_err().code(),
            "E102"
        );
        destroy(id).unwrap();
    }

    #[test]
    fn set_window_rejects_bad_args() {
        let id = create(50.0, Options::default()).unwrap();
        assert_eq!(set_window_seconds(id, f64::NAN).unwrap_err().code(), "E201");
        assert_eq!(set_window_seconds(id, -2.0).unwrap_err().code(), "E201");
        set_window_seconds(id, 15.0).unwrap();
        destroy(id).unwrap();
    }

    #[test]
    fn handles_are_unique_and_concurrent() {
        let ids: Vec<u64> = (0..8)
            .map(|_| create(50.0, Options::default()).unwrap())
            .collect();
        let mut sorted = ids.clone();
        sorted.dedup();
        assert_eq!(sorted.len(), ids.len());
        let threads: Vec<_> = ids
            .iter()
            .map(|&id| {
                std::thread::spawn(move || {
                    push(id, &[0.1f32; 25]).unwrap();
                    let _ = poll(id).unwrap();
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }
        for id in ids {
            destroy(id).unwrap();
        }
    }
}
