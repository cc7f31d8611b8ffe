use super::Collector;
use crate::aggregator::{AggregationEngine, Stat};
use crate::error::Result;
use crate::link::ManagementLink;
use futures::future::BoxFuture;
use serde::Serialize;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InterfaceCounters {
    pub sw_if_index: u32,
    pub rx_packets: u64,
    pub rx_bytes: u64,
    pub tx_packets: u64,
    pub tx_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InterfaceState {
    pub sw_if_index: u32,
    pub admin_up: bool,
    pub link_up: bool,
}

/// Produces synthetic per-interface counters and state so the agent can run
/// end to end against the loopback engine. Each round ends with a control
/// ping, the same barrier a real dump uses to know the reply stream is
/// complete.
pub struct SimulatedCountersCollector {
    name: String,
    interfaces: u32,
    round: u64,
}

impl SimulatedCountersCollector {
    pub fn new(name: impl Into<String>, interfaces: u32) -> Self {
        SimulatedCountersCollector {
            name: name.into(),
            interfaces,
            round: 0,
        }
    }

    fn counters(&self, sw_if_index: u32) -> InterfaceCounters {
        let base = self.round * (sw_if_index as u64 + 1);
        InterfaceCounters {
            sw_if_index,
            rx_packets: base * 10,
            rx_bytes: base * 640,
            tx_packets: base * 7,
            tx_bytes: base * 448,
        }
    }
}

impl Collector for SimulatedCountersCollector {
    fn name(&self) -> &str {
        &self.name
    }

    fn collect<'a>(
        &'a mut self,
        link: &'a ManagementLink,
        engine: &'a AggregationEngine,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.round += 1;

            let mut stats = Vec::with_capacity(self.interfaces as usize * 2);
            for sw_if_index in 0..self.interfaces {
                let state = InterfaceState {
                    sw_if_index,
                    admin_up: true,
                    link_up: true,
                };
                stats.push(Stat::of(&state)?);
                stats.push(Stat::of(&self.counters(sw_if_index))?);
            }

            let (_, context) = link.ping_sync(link.next_context_id()).await?;
            debug!(collector = %self.name, round = self.round, context, "Interface dump complete");

            for stat in stats {
                engine.submit(stat).await?;
            }
            Ok(())
        })
    }
}
