// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queue Bindings
//!
//! A [`QueueBinding`] is one declared queue, the routing-key patterns it is
//! bound under, and the handler (if any) consuming it.

use crate::handler::JobHandler;
use std::{fmt, sync::Arc};

/// A declared queue with its patterns and optional handler.
#[derive(Clone)]
pub struct QueueBinding {
    pub(crate) name: String,
    pub(crate) patterns: Vec<String>,
    pub(crate) handler: Option<Arc<dyn JobHandler>>,
}

impl QueueBinding {
    pub(crate) fn new(name: &str) -> QueueBinding {
        QueueBinding {
            name: name.to_owned(),
            patterns: vec![],
            handler: None,
        }
    }

    /// Queue name as declared on the broker, node prefix included.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Routing-key patterns the queue is bound under, in bind order.
    pub fn patterns(&self) -> &[String] {
        &self.patterns
    }

    /// Whether deliveries on this queue are consumed.
    pub fn has_handler(&self) -> bool {
        self.handler.is_some()
    }

    pub(crate) fn is_bound_to(&self, pattern: &str) -> bool {
        self.patterns.iter().any(|p| p == pattern)
    }
}

impl fmt::Debug for QueueBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueBinding")
            .field("name", &self.name)
            .field("patterns", &self.patterns)
            .field("handler", &self.handler.is_some())
            .finish()
    }
}
