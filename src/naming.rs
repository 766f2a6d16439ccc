// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Naming Scheme
//!
//! Derives the companion exchange, queue and routing-key names from a base
//! exchange or queue name. Every piece of the retry topology is addressed
//! through these functions so the topology builder and the retry consumer
//! always agree on names.

/// Exchange receiving messages rejected by the application consumers.
pub fn retry_exchange(exchange: &str) -> String {
    format!("{exchange}.retry")
}

/// Exchange routing rescheduled messages to the delay queues.
pub fn delay_exchange(exchange: &str) -> String {
    format!("{exchange}.delay")
}

/// Exchange feeding the terminal dead-letter queues.
pub fn dlx_exchange(exchange: &str) -> String {
    format!("{exchange}.dlx")
}

/// Queue consumed by the retry consumer.
pub fn retry_queue(queue: &str) -> String {
    format!("{queue}.retry")
}

/// Terminal queue for messages out of retries.
pub fn dlq_queue(queue: &str) -> String {
    format!("{queue}.dlq")
}

/// Name of the single, unnumbered delay queue.
pub fn delay_queue(queue: &str) -> String {
    format!("{queue}.delay")
}

/// Delay queue of retry `step`, starting at 1.
pub fn numbered_delay_queue(queue: &str, step: u32) -> String {
    format!("{queue}.delay.step{step}")
}

/// Key under which `<queue>` dead-letters into the retry exchange.
pub fn retry_routing_key(queue: &str) -> String {
    format!("rk.{queue}.retry")
}

/// Key under which `<queue>.retry` dead-letters into the dlx exchange.
pub fn dlq_routing_key(queue: &str) -> String {
    format!("rk.{queue}.dlq")
}

/// Step 0 addresses the unnumbered delay queue.
pub fn delay_routing_key(queue: &str, step: u32) -> String {
    if step > 0 {
        format!("rk.{queue}.delay.step{step}")
    } else {
        format!("rk.{queue}.delay")
    }
}

/// The four exchanges derived from one base exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeNames {
    pub main: String,
    pub retry: String,
    pub delay: String,
    pub dlx: String,
}

impl ExchangeNames {
    /// Names derived from `exchange`, itself kept as `main`.
    pub fn for_exchange(exchange: &str) -> ExchangeNames {
        ExchangeNames {
            main: exchange.to_owned(),
            retry: retry_exchange(exchange),
            delay: delay_exchange(exchange),
            dlx: dlx_exchange(exchange),
        }
    }

    /// Declaration order: main, retry, delay, dlx.
    pub fn all(&self) -> [&str; 4] {
        [&self.main, &self.retry, &self.delay, &self.dlx]
    }
}

/// Queue names and routing keys derived from one base queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueNames {
    pub main: String,
    pub retry: String,
    pub dlq: String,
    pub retry_routing_key: String,
    pub dlq_routing_key: String,
}

impl QueueNames {
    /// Names derived from `queue`, itself kept as `main`.
    pub fn for_queue(queue: &str) -> QueueNames {
        QueueNames {
            main: queue.to_owned(),
            retry: retry_queue(queue),
            dlq: dlq_queue(queue),
            retry_routing_key: retry_routing_key(queue),
            dlq_routing_key: dlq_routing_key(queue),
        }
    }

    /// Numbered delay queue of `step`.
    pub fn delay_queue(&self, step: u32) -> String {
        numbered_delay_queue(&self.main, step)
    }

    pub fn delay_routing_key(&self, step: u32) -> String {
        delay_routing_key(&self.main, step)
    }
}
