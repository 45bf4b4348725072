// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::collections::BTreeSet;
use std::ops::Range;

/// Allowlist applied while the snapshot is built.
///
/// Annotations whose names are not allowlisted are omitted; captured memory
/// outside the allowlisted ranges is zeroed (when a range partially
/// overlaps) or dropped (when it does not overlap at all). A policy with
/// `None` for a dimension leaves that dimension untouched.
#[derive(Debug, Clone, Default)]
pub struct SanitizationPolicy {
    pub allowed_annotations: Option<BTreeSet<String>>,
    pub allowed_memory_ranges: Option<Vec<Range<u64>>>,
}

impl SanitizationPolicy {
    pub fn allows_annotation(&self, name: &str) -> bool {
        match &self.allowed_annotations {
            Some(allowed) => allowed.contains(name),
            None => true,
        }
    }

    /// Whether any byte of `[base, base+len)` is allowlisted.
    pub fn touches_allowed_memory(&self, base: u64, len: u64) -> bool {
        match &self.allowed_memory_ranges {
            Some(ranges) => ranges
                .iter()
                .any(|r| r.start < base.saturating_add(len) && base < r.end),
            None => true,
        }
    }

    /// Zeroes the bytes of `[base, base+bytes.len())` that fall outside
    /// every allowlisted range.
    pub fn scrub_memory(&self, base: u64, bytes: &mut [u8]) {
        let Some(ranges) = &self.allowed_memory_ranges else {
            return;
        };
        for (i, byte) in bytes.iter_mut().enumerate() {
            let address = base + i as u64;
            if !ranges.iter().any(|r| r.contains(&address)) {
                *byte = 0;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_policy_allows_everything() {
        let policy = SanitizationPolicy::default();
        assert!(policy.allows_annotation("anything"));
        assert!(policy.touches_allowed_memory(0, u64::MAX));
        let mut bytes = vec![7u8; 8];
        policy.scrub_memory(0x1000, &mut bytes);
        assert_eq!(bytes, vec![7u8; 8]);
    }

    #[test]
    fn test_annotation_allowlist() {
        let policy = SanitizationPolicy {
            allowed_annotations: Some(BTreeSet::from(["version".to_string()])),
            allowed_memory_ranges: None,
        };
        assert!(policy.allows_annotation("version"));
        assert!(!policy.allows_annotation("user_email"));
    }

    #[test]
    fn test_memory_scrub_zeroes_outside_ranges() {
        let policy = SanitizationPolicy {
            allowed_annotations: None,
            allowed_memory_ranges: Some(vec![0x1002..0x1006]),
        };
        assert!(policy.touches_allowed_memory(0x1000, 8));
        assert!(!policy.touches_allowed_memory(0x2000, 8));

        let mut bytes = vec![0xff; 8];
        policy.scrub_memory(0x1000, &mut bytes);
        assert_eq!(bytes, [0, 0, 0xff, 0xff, 0xff, 0xff, 0, 0]);
    }
}
