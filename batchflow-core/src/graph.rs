//! Serialized graph definitions and the validated execution graph

use std::collections::{BTreeSet, HashMap, HashSet};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::PipelineConfig;
use crate::error::{Error, Result};
use crate::operator;
use crate::types::{Backend, DataType, StorageDevice};

/// Version of the serialized graph format
pub const GRAPH_FORMAT_VERSION: u32 = 1;

/// Declared output of an operator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputDef {
    /// Edge name, unique in the graph
    pub name: String,

    /// Declared element type, if fixed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dtype: Option<DataType>,

    /// Declared sample dimensionality, if fixed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ndim: Option<usize>,
}

impl OutputDef {
    /// Output with no declared type
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            dtype: None,
            ndim: None,
        }
    }

    /// Output with declared type and dimensionality
    pub fn typed(name: &str, dtype: DataType, ndim: usize) -> Self {
        Self {
            name: name.to_string(),
            dtype: Some(dtype),
            ndim: Some(ndim),
        }
    }
}

/// Serialized operator instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperatorDef {
    /// Instance name
    pub name: String,

    /// Registered kind
    pub kind: String,

    /// Backend to run on
    pub backend: Backend,

    /// Names of the edges consumed, in argument order
    #[serde(default)]
    pub inputs: Vec<String>,

    /// Outputs produced
    pub outputs: Vec<OutputDef>,

    /// Free-form arguments
    #[serde(default)]
    pub args: serde_json::Map<String, serde_json::Value>,
}

impl OperatorDef {
    /// Operator with no inputs, outputs or arguments
    pub fn new(name: &str, kind: &str, backend: Backend) -> Self {
        Self {
            name: name.to_string(),
            kind: kind.to_string(),
            backend,
            inputs: Vec::new(),
            outputs: Vec::new(),
            args: serde_json::Map::new(),
        }
    }

    /// Append an input edge
    pub fn input(mut self, edge: &str) -> Self {
        self.inputs.push(edge.to_string());
        self
    }

    /// Append an output
    pub fn output(mut self, output: OutputDef) -> Self {
        self.outputs.push(output);
        self
    }

    /// Set an argument
    pub fn arg(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.args.insert(key.to_string(), value.into());
        self
    }
}

/// Serialized pipeline: configuration, operators and outputs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphDef {
    /// Format version, must equal [`GRAPH_FORMAT_VERSION`]
    pub version: u32,

    /// Pipeline parameters stored with the graph
    #[serde(default)]
    pub config: PipelineConfig,

    /// Operators in any order
    pub operators: Vec<OperatorDef>,

    /// Edges returned to the caller, in order
    pub outputs: Vec<String>,
}

impl GraphDef {
    /// Empty graph with the given parameters
    pub fn new(config: PipelineConfig) -> Self {
        Self {
            version: GRAPH_FORMAT_VERSION,
            config,
            operators: Vec::new(),
            outputs: Vec::new(),
        }
    }

    /// Append an operator
    pub fn operator(mut self, op: OperatorDef) -> Self {
        self.operators.push(op);
        self
    }

    /// Append a pipeline output
    pub fn pipeline_output(mut self, edge: &str) -> Self {
        self.outputs.push(edge.to_string());
        self
    }

    /// Parse from the serialized form
    pub fn from_json(json: &str) -> Result<Self> {
        let def: GraphDef = serde_json::from_str(json)?;
        if def.version != GRAPH_FORMAT_VERSION {
            return Err(Error::InvalidGraph(format!(
                "unsupported graph format version {} (expected {GRAPH_FORMAT_VERSION})",
                def.version
            )));
        }
        Ok(def)
    }

    /// Serialize
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Whether `json` parses as a graph of a supported version
pub fn is_deserializable(json: &str) -> bool {
    GraphDef::from_json(json).is_ok()
}

/// Pipeline phase an operator runs in
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Stage {
    /// Host operators
    Cpu,

    /// Mixed and device operators
    Gpu,
}

impl From<Backend> for Stage {
    fn from(backend: Backend) -> Self {
        match backend {
            Backend::Cpu => Stage::Cpu,
            Backend::Mixed | Backend::Gpu => Stage::Gpu,
        }
    }
}

/// Data flowing from one operator output to its consumers
#[derive(Debug, Clone)]
pub struct Edge {
    /// Output declaration
    pub def: OutputDef,

    /// Producing node
    pub producer: usize,

    /// Device the data lives on
    pub device: StorageDevice,
}

/// Validated operator instance
#[derive(Debug, Clone)]
pub struct Node {
    /// Instance name
    pub name: String,

    /// Registered kind
    pub kind: String,

    /// Backend
    pub backend: Backend,

    /// Consumed edges
    pub inputs: Vec<usize>,

    /// Produced edges
    pub outputs: Vec<usize>,

    /// Arguments
    pub args: serde_json::Map<String, serde_json::Value>,

    /// Whether the node is fed by the caller
    pub is_external_source: bool,
}

impl Node {
    /// Stage the node runs in
    pub fn stage(&self) -> Stage {
        self.backend.into()
    }
}

/// Acyclic, backend-consistent operator graph in execution order
#[derive(Debug, Clone)]
pub struct Graph {
    nodes: Vec<Node>,
    edges: Vec<Edge>,
    outputs: Vec<usize>,
    node_index: HashMap<String, usize>,
}

impl Graph {
    /// Validate a definition and order its operators
    pub fn build(def: &GraphDef, config: &PipelineConfig) -> Result<Self> {
        if def.version != GRAPH_FORMAT_VERSION {
            return Err(Error::InvalidGraph(format!(
                "unsupported graph format version {}",
                def.version
            )));
        }

        let mut names = HashSet::new();
        let mut producers: HashMap<&str, (usize, usize)> = HashMap::new();
        let mut external = Vec::with_capacity(def.operators.len());
        for (i, op) in def.operators.iter().enumerate() {
            if !names.insert(op.name.as_str()) {
                return Err(Error::InvalidGraph(format!("duplicate operator name '{}'", op.name)));
            }
            let schema = operator::schema(&op.kind).ok_or_else(|| {
                Error::InvalidGraph(format!("operator '{}' has unknown kind '{}'", op.name, op.kind))
            })?;
            if !schema.backends.contains(&op.backend) {
                return Err(Error::InvalidGraph(format!(
                    "operator '{}' of kind '{}' has no {:?} implementation",
                    op.name, op.kind, op.backend
                )));
            }
            if op.inputs.len() < schema.min_inputs || op.inputs.len() > schema.max_inputs {
                return Err(Error::InvalidGraph(format!(
                    "operator '{}' takes {}..={} inputs, {} given",
                    op.name,
                    schema.min_inputs,
                    schema.max_inputs,
                    op.inputs.len()
                )));
            }
            let outputs_ok = match schema.num_outputs {
                Some(n) => op.outputs.len() == n,
                None => !op.outputs.is_empty(),
            };
            if !outputs_ok {
                return Err(Error::InvalidGraph(format!(
                    "operator '{}' declares {} outputs",
                    op.name,
                    op.outputs.len()
                )));
            }
            for (j, out) in op.outputs.iter().enumerate() {
                if producers.insert(out.name.as_str(), (i, j)).is_some() {
                    return Err(Error::InvalidGraph(format!("duplicate output name '{}'", out.name)));
                }
            }
            external.push(schema.is_external_source);
        }

        // Dependencies between operator definitions
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); def.operators.len()];
        let mut indegree = vec![0usize; def.operators.len()];
        for (i, op) in def.operators.iter().enumerate() {
            for input in &op.inputs {
                let &(producer, _) = producers.get(input.as_str()).ok_or_else(|| {
                    Error::InvalidGraph(format!(
                        "input '{input}' of operator '{}' has no producer",
                        op.name
                    ))
                })?;
                let produced_on = def.operators[producer].backend.output_device();
                if produced_on != op.backend.input_device() {
                    return Err(Error::InvalidGraph(format!(
                        "operator '{}' ({:?}) cannot consume '{input}' which lives on {:?}; \
                         insert a mixed operator",
                        op.name, op.backend, produced_on
                    )));
                }
                dependents[producer].push(i);
                indegree[i] += 1;
            }
        }

        // Kahn's algorithm, CPU stage first, then definition order
        let stage_of = |i: usize| Stage::from(def.operators[i].backend);
        let mut ready: BTreeSet<(Stage, usize)> = (0..def.operators.len())
            .filter(|&i| indegree[i] == 0)
            .map(|i| (stage_of(i), i))
            .collect();
        let mut order = Vec::with_capacity(def.operators.len());
        while let Some(next) = ready.pop_first() {
            let i = next.1;
            order.push(i);
            for &d in &dependents[i] {
                indegree[d] -= 1;
                if indegree[d] == 0 {
                    ready.insert((stage_of(d), d));
                }
            }
        }
        if order.len() != def.operators.len() {
            return Err(Error::InvalidGraph("operator graph contains a cycle".into()));
        }

        if config.device_id < 0 {
            if let Some(op) = def.operators.iter().find(|op| op.backend != Backend::Cpu) {
                return Err(Error::InvalidConfig(format!(
                    "operator '{}' needs a device but the pipeline is CPU-only",
                    op.name
                )));
            }
        }

        // Lay out nodes and edges in execution order
        let mut position = vec![0usize; def.operators.len()];
        for (pos, &i) in order.iter().enumerate() {
            position[i] = pos;
        }
        let mut edges = Vec::new();
        let mut edge_index: HashMap<&str, usize> = HashMap::new();
        let mut nodes = Vec::with_capacity(order.len());
        for &i in &order {
            let op = &def.operators[i];
            let outputs = op
                .outputs
                .iter()
                .map(|out| {
                    edges.push(Edge {
                        def: out.clone(),
                        producer: position[i],
                        device: op.backend.output_device(),
                    });
                    edge_index.insert(out.name.as_str(), edges.len() - 1);
                    edges.len() - 1
                })
                .collect();
            // Producers precede consumers, so their edges already exist
            let inputs = op
                .inputs
                .iter()
                .map(|name| edge_index[name.as_str()])
                .collect();
            nodes.push(Node {
                name: op.name.clone(),
                kind: op.kind.clone(),
                backend: op.backend,
                inputs,
                outputs,
                args: op.args.clone(),
                is_external_source: external[i],
            });
        }

        if def.outputs.is_empty() {
            return Err(Error::InvalidGraph("pipeline has no outputs".into()));
        }
        let outputs = def
            .outputs
            .iter()
            .map(|name| {
                edge_index.get(name.as_str()).copied().ok_or_else(|| {
                    Error::InvalidGraph(format!("pipeline output '{name}' is not produced"))
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let node_index = nodes.iter().enumerate().map(|(i, n)| (n.name.clone(), i)).collect();
        debug!(nodes = nodes.len(), edges = edges.len(), "graph validated");
        Ok(Self {
            nodes,
            edges,
            outputs,
            node_index,
        })
    }

    /// Nodes in execution order
    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    /// All edges
    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    /// Edge `i`
    pub fn edge(&self, i: usize) -> &Edge {
        &self.edges[i]
    }

    /// Edges returned to the caller
    pub fn outputs(&self) -> &[usize] {
        &self.outputs
    }

    /// Node by instance name
    pub fn node(&self, name: &str) -> Result<(usize, &Node)> {
        self.node_index
            .get(name)
            .map(|&i| (i, &self.nodes[i]))
            .ok_or_else(|| Error::UnknownName(format!("operator '{name}'")))
    }

    /// Nodes fed by the caller
    pub fn external_sources(&self) -> impl Iterator<Item = (usize, &Node)> {
        self.nodes.iter().enumerate().filter(|(_, n)| n.is_external_source)
    }

    /// Whether any node runs in the GPU stage
    pub fn uses_device(&self) -> bool {
        self.nodes.iter().any(|n| n.stage() == Stage::Gpu)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builtin::EXTERNAL_SOURCE;

    fn init() {
        crate::init();
    }

    fn source(name: &str, backend: Backend) -> OperatorDef {
        OperatorDef::new(name, EXTERNAL_SOURCE, backend).output(OutputDef::new(&format!("{name}_out")))
    }

    fn contiguous(name: &str, backend: Backend, input: &str) -> OperatorDef {
        OperatorDef::new(name, crate::builtin::MAKE_CONTIGUOUS, backend)
            .input(input)
            .output(OutputDef::new(&format!("{name}_out")))
    }

    #[test]
    fn test_execution_order_follows_stages() {
        init();
        let def = GraphDef::new(PipelineConfig::default())
            .operator(contiguous("gpu", Backend::Gpu, "mixed_out"))
            .operator(contiguous("mixed", Backend::Mixed, "cpu_out"))
            .operator(contiguous("cpu", Backend::Cpu, "src_out"))
            .operator(source("src", Backend::Cpu))
            .pipeline_output("gpu_out")
            .pipeline_output("cpu_out");
        let graph = Graph::build(&def, &PipelineConfig::default()).unwrap();
        let order: Vec<&str> = graph.nodes().iter().map(|n| n.name.as_str()).collect();
        assert_eq!(order, ["src", "cpu", "mixed", "gpu"]);
        assert_eq!(graph.outputs().len(), 2);
        assert_eq!(graph.edge(graph.outputs()[0]).device, StorageDevice::Gpu);
        assert_eq!(graph.external_sources().count(), 1);
    }

    #[test]
    fn test_cycle_rejected() {
        init();
        let def = GraphDef::new(PipelineConfig::default())
            .operator(contiguous("a", Backend::Cpu, "b_out"))
            .operator(contiguous("b", Backend::Cpu, "a_out"))
            .pipeline_output("a_out");
        let err = Graph::build(&def, &PipelineConfig::default()).unwrap_err();
        assert!(err.to_string().contains("cycle"));
    }

    #[test]
    fn test_backend_mismatch_rejected() {
        init();
        let def = GraphDef::new(PipelineConfig::default())
            .operator(source("src", Backend::Gpu))
            .operator(contiguous("host", Backend::Cpu, "src_out"))
            .pipeline_output("host_out");
        assert!(matches!(
            Graph::build(&def, &PipelineConfig::default()),
            Err(Error::InvalidGraph(_))
        ));
    }

    #[test]
    fn test_dangling_input_and_missing_output() {
        init();
        let dangling = GraphDef::new(PipelineConfig::default())
            .operator(contiguous("a", Backend::Cpu, "nowhere"))
            .pipeline_output("a_out");
        assert!(Graph::build(&dangling, &PipelineConfig::default()).is_err());

        let missing = GraphDef::new(PipelineConfig::default())
            .operator(source("src", Backend::Cpu))
            .pipeline_output("other");
        assert!(Graph::build(&missing, &PipelineConfig::default()).is_err());
    }

    #[test]
    fn test_cpu_only_pipeline_rejects_device_operators() {
        init();
        let config = PipelineConfig { device_id: -1, ..PipelineConfig::default() };
        let def = GraphDef::new(config.clone())
            .operator(source("src", Backend::Cpu))
            .operator(contiguous("up", Backend::Mixed, "src_out"))
            .pipeline_output("up_out");
        assert!(matches!(Graph::build(&def, &config), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn test_json_round_trip_and_version() {
        let def = GraphDef::new(PipelineConfig::default())
            .operator(source("src", Backend::Cpu))
            .pipeline_output("src_out");
        let json = def.to_json().unwrap();
        assert!(is_deserializable(&json));
        assert_eq!(GraphDef::from_json(&json).unwrap(), def);

        let future = json.replacen("\"version\":1", "\"version\":7", 1);
        assert!(!is_deserializable(&future));
        assert!(!is_deserializable("not json"));
    }
}
