// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # OpenTelemetry Integration for RabbitMQ
//!
//! Trace context travels in the message headers: the publisher injects the
//! caller's context and every consumer worker opens a consumer span whose parent
//! is extracted from the delivery.

use lapin::{
    protocol::basic::AMQPProperties,
    types::{AMQPValue, ShortString},
};
use opentelemetry::{
    global::{BoxedSpan, BoxedTracer},
    propagation::{Extractor, Injector},
    trace::{SpanKind, Tracer},
    Context,
};
use std::{borrow::Cow, collections::BTreeMap};

/// An adapter for injecting and extracting OpenTelemetry context from RabbitMQ headers.
///
/// This struct implements the OpenTelemetry `Injector` and `Extractor` traits,
/// allowing trace context to be propagated through RabbitMQ message headers.
pub(crate) struct RabbitMQTracePropagator<'a> {
    headers: &'a mut BTreeMap<ShortString, AMQPValue>,
}

impl<'a> RabbitMQTracePropagator<'a> {
    /// Creates a new RabbitMQTracePropagator.
    ///
    /// # Parameters
    /// * `headers` - A mutable reference to the BTreeMap containing RabbitMQ headers
    ///
    /// # Returns
    /// A new RabbitMQTracePropagator instance
    pub(crate) fn new(headers: &'a mut BTreeMap<ShortString, AMQPValue>) -> Self {
        Self { headers }
    }
}

impl Injector for RabbitMQTracePropagator<'_> {
    /// Sets a trace context key-value pair in RabbitMQ message headers.
    ///
    /// Keys are lowercased, as the propagators look them up in lowercase.
    ///
    /// # Parameters
    /// * `key` - The header key
    /// * `value` - The header value
    fn set(&mut self, key: &str, value: String) {
        self.headers.insert(
            key.to_lowercase().into(),
            AMQPValue::LongString(value.into()),
        );
    }
}

impl Extractor for RabbitMQTracePropagator<'_> {
    /// Gets a trace context value from RabbitMQ message headers.
    ///
    /// Only long string headers carry trace context; anything else is ignored.
    ///
    /// # Parameters
    /// * `key` - The header key to retrieve
    ///
    /// # Returns
    /// The header value as a string slice, or None if not found
    fn get(&self, key: &str) -> Option<&str> {
        self.headers.get(key).and_then(|header_value| {
            if let AMQPValue::LongString(header_value) = header_value {
                std::str::from_utf8(header_value.as_bytes()).ok()
            } else {
                None
            }
        })
    }

    /// Lists every header key, whatever its value type.
    ///
    /// # Returns
    /// The header keys in their stored order
    fn keys(&self) -> Vec<&str> {
        self.headers.keys().map(|header| header.as_str()).collect()
    }
}

/// Starts a consumer span for one delivery.
///
/// The parent context is extracted from the delivery headers, so the span joins
/// the trace of the publisher when it injected one.
///
/// # Parameters
/// * `props` - The delivery properties carrying the headers
/// * `tracer` - The tracer creating the span
/// * `name` - The span name, the queue being consumed
///
/// # Returns
/// A started consumer span
pub(crate) fn new_span(props: &AMQPProperties, tracer: &BoxedTracer, name: &str) -> BoxedSpan {
    let ctx: Context = opentelemetry::global::get_text_map_propagator(|propagator| {
        propagator.extract(&RabbitMQTracePropagator::new(
            &mut props.headers().clone().unwrap_or_default().inner().clone(),
        ))
    });

    tracer
        .span_builder(Cow::from(name.to_owned()))
        .with_kind(SpanKind::Consumer)
        .start_with_context(tracer, &ctx)
}
