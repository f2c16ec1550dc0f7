//! The outbound target deny list.
//!
//! Glob patterns match the URL's host string (shell-style `*`); CIDR
//! patterns match resolved addresses. A delivery target is checked both
//! ways: the literal host and every A/AAAA address it resolves to. One
//! hit fails the delivery before any network I/O.

use globset::{Glob, GlobMatcher};
use ipnet::IpNet;
use std::net::IpAddr;
use tracing::warn;

use tmhub_core::error::DeliveryError;
use tmhub_core::webhook::{PatternType, UrlDenyEntry};

/// Compiled deny patterns.
pub struct DenyList {
    globs: Vec<(GlobMatcher, String)>,
    cidrs: Vec<(IpNet, String)>,
}

impl DenyList {
    /// Compile stored entries. Unparseable patterns are logged and
    /// skipped rather than failing startup.
    pub fn compile(entries: &[UrlDenyEntry]) -> Self {
        let mut globs = Vec::new();
        let mut cidrs = Vec::new();
        for entry in entries {
            match entry.pattern_type {
                PatternType::Glob => match Glob::new(&entry.pattern) {
                    Ok(glob) => globs.push((glob.compile_matcher(), entry.pattern.clone())),
                    Err(e) => warn!(pattern = %entry.pattern, error = %e, "Bad glob pattern skipped"),
                },
                PatternType::Cidr => match entry.pattern.parse::<IpNet>() {
                    Ok(net) => cidrs.push((net, entry.pattern.clone())),
                    Err(e) => warn!(pattern = %entry.pattern, error = %e, "Bad CIDR pattern skipped"),
                },
            }
        }
        Self { globs, cidrs }
    }

    /// The built-in seed, for processes running before the database copy
    /// is loaded.
    pub fn builtin() -> Self {
        Self::compile(&tmhub_core::webhook::default_deny_seed())
    }

    /// First pattern matching the literal host, if any. IP-literal hosts
    /// are additionally matched against the CIDR patterns.
    pub fn match_host(&self, host: &str) -> Option<&str> {
        let host = host.trim_matches(['[', ']']).to_ascii_lowercase();
        for (glob, pattern) in &self.globs {
            if glob.is_match(&host) {
                return Some(pattern);
            }
        }
        if let Ok(ip) = host.parse::<IpAddr>() {
            return self.match_ip(ip);
        }
        None
    }

    /// First CIDR pattern containing the address, if any.
    pub fn match_ip(&self, ip: IpAddr) -> Option<&str> {
        self.cidrs
            .iter()
            .find(|(net, _)| net.contains(&ip))
            .map(|(_, pattern)| pattern.as_str())
    }

    /// Check a host and its resolved addresses; a single hit is fatal.
    pub fn check(&self, host: &str, resolved: &[IpAddr]) -> Result<(), DeliveryError> {
        if let Some(pattern) = self.match_host(host) {
            return Err(DeliveryError::SsrfBlocked { pattern: pattern.to_string() });
        }
        for ip in resolved {
            if let Some(pattern) = self.match_ip(*ip) {
                return Err(DeliveryError::SsrfBlocked { pattern: pattern.to_string() });
            }
            // An address may also be written out by a glob (e.g. "127.*").
            if let Some(pattern) = self
                .globs
                .iter()
                .find(|(glob, _)| glob.is_match(ip.to_string()))
                .map(|(_, p)| p.as_str())
            {
                return Err(DeliveryError::SsrfBlocked { pattern: pattern.to_string() });
            }
        }
        Ok(())
    }
}
