//! Trace context propagation through message headers.
//!
//! A published message carries its producer span as a W3C `traceparent`
//! (and `tracestate`) header; the consumer extracts it and parents its own
//! span on it, so one trace spans both processes.
//!
//! ```text
//!  producer cx ──inject──▶ headers["traceparent"] ══ broker ══▶ headers ──extract──▶ consumer parent cx
//! ```

use std::collections::HashMap;

use opentelemetry::propagation::{Extractor, Injector};

/// Writes propagation fields into a message header map.
pub struct HeaderInjector<'a>(pub &'a mut HashMap<String, String>);

impl Injector for HeaderInjector<'_> {
    fn set(&mut self, key: &str, value: String) {
        self.0.insert(key.to_string(), value);
    }
}

/// Reads propagation fields from a message header map.
///
/// Lookups are exact first, then case-insensitive, since some brokers
/// normalise header names.
pub struct HeaderExtractor<'a>(pub &'a HashMap<String, String>);

impl Extractor for HeaderExtractor<'_> {
    fn get(&self, key: &str) -> Option<&str> {
        self.0
            .get(key)
            .or_else(|| {
                self.0
                    .iter()
                    .find(|(k, _)| k.eq_ignore_ascii_case(key))
                    .map(|(_, v)| v)
            })
            .map(String::as_str)
    }

    fn keys(&self) -> Vec<&str> {
        self.0.keys().map(String::as_str).collect()
    }
}
