//! Resource limits and checked arithmetic helpers

use anyhow::{anyhow, Result};

/// Resource limits for VM execution
#[derive(Debug, Clone)]
pub struct ResourceLimits {
    pub max_stack_depth: usize,
    pub max_call_depth: usize,
    pub max_error_frames: usize,
    /// Worker thread count for the task runtime (None = core count)
    pub worker_threads: Option<usize>,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            max_stack_depth: 10_000,
            max_call_depth: 1_000,
            max_error_frames: 1_000,
            worker_threads: None,
        }
    }
}

impl ResourceLimits {
    /// Limits suitable for untrusted code
    pub fn sandboxed() -> Self {
        Self {
            max_stack_depth: 1_000,
            max_call_depth: 100,
            max_error_frames: 100,
            worker_threads: Some(2),
        }
    }

    /// Limits suitable for tests
    pub fn testing() -> Self {
        Self {
            max_stack_depth: 200,
            max_call_depth: 20,
            max_error_frames: 20,
            worker_threads: Some(2),
        }
    }
}

/// Safe arithmetic for the index/range computations the dispatch loop does
/// on its own behalf (operand promotion has its own overflow rules).
pub mod checked_ops {
    use super::*;

    #[inline]
    pub fn add_i64(a: i64, b: i64) -> Result<i64> {
        a.checked_add(b)
            .ok_or_else(|| anyhow!("Integer overflow in addition: {} + {}", a, b))
    }

    #[inline]
    pub fn sub_i64(a: i64, b: i64) -> Result<i64> {
        a.checked_sub(b)
            .ok_or_else(|| anyhow!("Integer overflow in subtraction: {} - {}", a, b))
    }

    #[inline]
    pub fn mul_i64(a: i64, b: i64) -> Result<i64> {
        a.checked_mul(b)
            .ok_or_else(|| anyhow!("Integer overflow in multiplication: {} * {}", a, b))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checked_ops() {
        assert_eq!(checked_ops::add_i64(2, 3).unwrap(), 5);
        assert!(checked_ops::add_i64(i64::MAX, 1).is_err());
        assert!(checked_ops::sub_i64(i64::MIN, 1).is_err());
        assert!(checked_ops::mul_i64(i64::MAX, 2).is_err());
    }

    #[test]
    fn test_limit_presets() {
        let default = ResourceLimits::default();
        let sandboxed = ResourceLimits::sandboxed();
        assert!(sandboxed.max_stack_depth < default.max_stack_depth);
        assert!(sandboxed.max_call_depth < default.max_call_depth);
        assert_eq!(sandboxed.worker_threads, Some(2));
    }
}
