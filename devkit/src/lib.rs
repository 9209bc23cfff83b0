/*!
# Fleet DevKit - stubs and helpers for testing the collector

- a scripted [`SnapshotProvider`](fleet_agent::SnapshotProvider) so agents run without GPUs
- builders for well-formed packets
- a harness booting a real aggregator on a loopback port
*/

pub mod packet_builders;
pub mod provider_stub;
pub mod test_utils;

pub use packet_builders::{PacketBuilder, TaskRecordBuilder};
pub use provider_stub::ScriptedProvider;
pub use test_utils::TestHarness;
