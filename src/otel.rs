// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # OpenTelemetry Context Propagation
//!
//! Extracts the trace context carried in a delivery's headers into a consumer
//! span, and injects that span's context into the headers of the follow-up
//! message, so a chain of jobs shows up as one trace. With no global
//! propagator installed both directions are no-ops.

use opentelemetry::{
    global::{BoxedSpan, BoxedTracer},
    propagation::{Extractor, Injector},
    trace::{SpanKind, Tracer},
    Context,
};
use std::{borrow::Cow, collections::BTreeMap};

/// Adapter exposing string message headers to OpenTelemetry propagators.
pub(crate) struct HeaderPropagator<'a> {
    headers: &'a mut BTreeMap<String, String>,
}

impl<'a> HeaderPropagator<'a> {
    pub(crate) fn new(headers: &'a mut BTreeMap<String, String>) -> Self {
        Self { headers }
    }
}

impl Injector for HeaderPropagator<'_> {
    fn set(&mut self, key: &str, value: String) {
        self.headers.insert(key.to_lowercase(), value);
    }
}

impl Extractor for HeaderPropagator<'_> {
    fn get(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(String::as_str)
    }

    fn keys(&self) -> Vec<&str> {
        self.headers.keys().map(String::as_str).collect()
    }
}

/// Creates a consumer span named `name`, parented on the context found in
/// `headers`.
pub(crate) fn new_span(
    headers: &BTreeMap<String, String>,
    tracer: &BoxedTracer,
    name: &str,
) -> (Context, BoxedSpan) {
    let mut headers = headers.clone();
    let ctx = opentelemetry::global::get_text_map_propagator(|propagator| {
        propagator.extract(&HeaderPropagator::new(&mut headers))
    });

    let span = tracer
        .span_builder(Cow::from(name.to_owned()))
        .with_kind(SpanKind::Consumer)
        .start_with_context(tracer, &ctx);

    (ctx, span)
}

/// Serializes `ctx` into a fresh header map.
pub(crate) fn inject(ctx: &Context) -> BTreeMap<String, String> {
    let mut headers = BTreeMap::new();
    opentelemetry::global::get_text_map_propagator(|propagator| {
        propagator.inject_context(ctx, &mut HeaderPropagator::new(&mut headers))
    });
    headers
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn propagator_round_trips_through_lowercased_keys() {
        let mut headers = BTreeMap::new();
        let mut propagator = HeaderPropagator::new(&mut headers);
        propagator.set("TraceParent", "00-abc-def-01".to_owned());

        assert_eq!(propagator.get("traceparent"), Some("00-abc-def-01"));
        assert_eq!(propagator.keys(), vec!["traceparent"]);
    }
}
