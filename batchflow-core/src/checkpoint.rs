//! Serialized snapshots of operator state plus caller context
//!
//! The wire format is a 4-byte magic, a little-endian `u32` format version
//! and a bincode-encoded [`Checkpoint`].

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::executor::OperatorStates;
use crate::graph::Graph;

const MAGIC: &[u8; 4] = b"BFCK";

/// Version of the checkpoint encoding
pub const CHECKPOINT_VERSION: u32 = 1;

/// Opaque caller data stored alongside operator state
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalContext {
    /// Data owned by the code driving the pipeline
    pub pipeline_data: Vec<u8>,

    /// Data owned by the iterator wrapping the pipeline
    pub iterator_data: Vec<u8>,
}

/// State of one operator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperatorCheckpoint {
    /// Instance name
    pub name: String,

    /// Registered kind
    pub kind: String,

    /// Serialized state, empty for stateless operators
    pub state: Vec<u8>,
}

/// Snapshot of a pipeline at an iteration boundary
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Iterations consumed when the snapshot was taken
    pub iteration: u64,

    /// Batch size the pipeline was built with
    pub max_batch_size: usize,

    /// Every operator in execution order
    pub operators: Vec<OperatorCheckpoint>,

    /// Caller data
    pub external_context: ExternalContext,
}

impl Checkpoint {
    /// Encode with magic and version header
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(64);
        out.extend_from_slice(MAGIC);
        out.extend_from_slice(&CHECKPOINT_VERSION.to_le_bytes());
        bincode::serialize_into(&mut out, self)?;
        Ok(out)
    }

    /// Decode, checking magic and version
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < 8 || &bytes[..4] != MAGIC {
            return Err(Error::Checkpoint("not a checkpoint".into()));
        }
        let mut version = [0u8; 4];
        version.copy_from_slice(&bytes[4..8]);
        let version = u32::from_le_bytes(version);
        if version != CHECKPOINT_VERSION {
            return Err(Error::Checkpoint(format!(
                "unsupported checkpoint version {version}"
            )));
        }
        Ok(bincode::deserialize(&bytes[8..])?)
    }

    /// Reject checkpoints taken from a structurally different pipeline
    pub fn check_compatible(&self, graph: &Graph, max_batch_size: usize) -> Result<()> {
        if self.operators.len() != graph.nodes().len() {
            return Err(Error::Checkpoint(format!(
                "checkpoint has {} operators, pipeline has {}",
                self.operators.len(),
                graph.nodes().len()
            )));
        }
        for (saved, node) in self.operators.iter().zip(graph.nodes()) {
            if saved.name != node.name || saved.kind != node.kind {
                return Err(Error::Checkpoint(format!(
                    "checkpoint operator '{}' ({}) does not match pipeline operator '{}' ({})",
                    saved.name, saved.kind, node.name, node.kind
                )));
            }
        }
        if self.max_batch_size != max_batch_size {
            return Err(Error::Checkpoint(format!(
                "checkpoint was taken with batch size {}, pipeline uses {max_batch_size}",
                self.max_batch_size
            )));
        }
        Ok(())
    }

    /// Operator states keyed by node index, skipping empty ones
    pub(crate) fn states(&self) -> OperatorStates {
        self.operators
            .iter()
            .enumerate()
            .filter(|(_, op)| !op.state.is_empty())
            .map(|(i, op)| (i, op.state.clone()))
            .collect()
    }
}

/// Tracks the last consistent state of a pipeline
#[derive(Debug, Default)]
pub struct CheckpointManager {
    enabled: bool,
    consumed: Option<(u64, OperatorStates)>,
}

impl CheckpointManager {
    /// Manager for a pipeline with checkpointing on or off
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            consumed: None,
        }
    }

    /// Whether checkpoints can be taken
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn ensure_enabled(&self) -> Result<()> {
        if self.enabled {
            Ok(())
        } else {
            Err(Error::CheckpointingDisabled)
        }
    }

    /// Record the state after the output of `iteration` was handed out
    pub fn record_consumed(&mut self, iteration: u64, states: OperatorStates) {
        if self.enabled {
            self.consumed = Some((iteration + 1, states));
        }
    }

    /// Build a checkpoint from the last consumed output, or from the
    /// initial state if nothing has been consumed yet
    pub fn capture(
        &self,
        graph: &Graph,
        max_batch_size: usize,
        start: (u64, &OperatorStates),
        context: &ExternalContext,
    ) -> Result<Checkpoint> {
        self.ensure_enabled()?;
        let (iteration, states) = match &self.consumed {
            Some((iteration, states)) => (*iteration, states),
            None => start,
        };
        let operators = graph
            .nodes()
            .iter()
            .enumerate()
            .map(|(i, node)| OperatorCheckpoint {
                name: node.name.clone(),
                kind: node.kind.clone(),
                state: states
                    .iter()
                    .find(|(n, _)| *n == i)
                    .map(|(_, s)| s.clone())
                    .unwrap_or_default(),
            })
            .collect();
        info!(iteration, "captured checkpoint");
        Ok(Checkpoint {
            iteration,
            max_batch_size,
            operators,
            external_context: context.clone(),
        })
    }

    /// Decode and validate a checkpoint for restoring
    pub fn load(&self, bytes: &[u8], graph: &Graph, max_batch_size: usize) -> Result<Checkpoint> {
        self.ensure_enabled()?;
        let checkpoint = Checkpoint::from_bytes(bytes)?;
        checkpoint.check_compatible(graph, max_batch_size)?;
        debug!(iteration = checkpoint.iteration, "checkpoint accepted");
        Ok(checkpoint)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builtin::EXTERNAL_SOURCE;
    use crate::config::PipelineConfig;
    use crate::graph::{GraphDef, OperatorDef, OutputDef};
    use crate::types::Backend;

    fn graph(name: &str) -> Graph {
        crate::init();
        let def = GraphDef::new(PipelineConfig::default())
            .operator(OperatorDef::new(name, EXTERNAL_SOURCE, Backend::Cpu).output(OutputDef::new("out")))
            .pipeline_output("out");
        Graph::build(&def, &PipelineConfig::default()).unwrap()
    }

    #[test]
    fn test_encoding_round_trip() {
        let checkpoint = Checkpoint {
            iteration: 4,
            max_batch_size: 8,
            operators: vec![OperatorCheckpoint {
                name: "src".into(),
                kind: EXTERNAL_SOURCE.into(),
                state: vec![1, 2, 3],
            }],
            external_context: ExternalContext {
                pipeline_data: b"epoch=2".to_vec(),
                iterator_data: Vec::new(),
            },
        };
        let bytes = checkpoint.to_bytes().unwrap();
        assert_eq!(&bytes[..4], MAGIC);
        assert_eq!(Checkpoint::from_bytes(&bytes).unwrap(), checkpoint);
    }

    #[test]
    fn test_corrupt_input_rejected() {
        assert!(Checkpoint::from_bytes(b"nope").is_err());
        let mut bytes = b"BFCK".to_vec();
        bytes.extend_from_slice(&9u32.to_le_bytes());
        assert!(matches!(Checkpoint::from_bytes(&bytes), Err(Error::Checkpoint(_))));
    }

    #[test]
    fn test_structural_mismatch_rejected() {
        let manager = CheckpointManager::new(true);
        let empty = Vec::new();
        let taken = manager
            .capture(&graph("src"), 8, (0, &empty), &ExternalContext::default())
            .unwrap();
        let bytes = taken.to_bytes().unwrap();
        assert!(manager.load(&bytes, &graph("src"), 8).is_ok());
        assert!(manager.load(&bytes, &graph("other"), 8).is_err());
        assert!(manager.load(&bytes, &graph("src"), 4).is_err());
    }

    #[test]
    fn test_capture_uses_last_consumed_state() {
        let mut manager = CheckpointManager::new(true);
        let initial = vec![(0, vec![0])];
        manager.record_consumed(2, vec![(0, vec![7])]);
        let taken = manager
            .capture(&graph("src"), 8, (0, &initial), &ExternalContext::default())
            .unwrap();
        assert_eq!(taken.iteration, 3);
        assert_eq!(taken.operators[0].state, vec![7]);
        assert_eq!(taken.states(), vec![(0, vec![7])]);
    }

    #[test]
    fn test_disabled_manager_refuses() {
        let manager = CheckpointManager::new(false);
        let empty = Vec::new();
        let res = manager.capture(&graph("src"), 8, (0, &empty), &ExternalContext::default());
        assert!(matches!(res, Err(Error::CheckpointingDisabled)));
    }
}
