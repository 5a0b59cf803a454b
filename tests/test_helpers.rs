//! Test helpers and utilities for integration tests

use mqclient::transport::memory::QueueDefinition;
use mqclient::transport::BrokerPtr;
use mqclient::{
    connect, ConnectOptions, Connection, Endpoint, MemoryBroker, ReconnectConfig, ReconnectPolicy,
};
use std::sync::Arc;

pub const QUEUE_MANAGER: &str = "QM1";

/// Queue manager with the named local queues defined
#[allow(dead_code)]
pub fn embedded(queues: &[&str]) -> MemoryBroker {
    let memory = MemoryBroker::new(QUEUE_MANAGER);
    for name in queues {
        memory.define_queue(QueueDefinition::local(*name));
    }
    memory
}

#[allow(dead_code)]
pub fn options() -> ConnectOptions {
    ConnectOptions::new(Endpoint::memory(QUEUE_MANAGER))
}

/// Reconnecting options with millisecond backoff
#[allow(dead_code)]
pub fn reconnecting_options(max_attempts: Option<u32>) -> ConnectOptions {
    options()
        .reconnect(ReconnectPolicy::Reconnect)
        .reconnect_config(ReconnectConfig {
            max_attempts,
            backoff_pattern: vec![5, 10],
            sustained_delay: 20,
        })
}

#[allow(dead_code)]
pub async fn connect_with(memory: &MemoryBroker, options: ConnectOptions) -> Connection {
    let broker: BrokerPtr = Arc::new(memory.clone());
    connect(broker, options)
        .await
        .expect("connect to embedded queue manager")
}

#[allow(dead_code)]
pub async fn connected(memory: &MemoryBroker) -> Connection {
    connect_with(memory, options()).await
}
