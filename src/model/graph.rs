//! Model construction from a parsed description.

use std::collections::HashMap;

use super::partition::Partition;
use super::types::{NodeId, PartitionId, SplitKey};
use super::validate::validate_model;
use crate::dsl::{Directive, ModelAst, NodeDef};
use crate::error::{DendriteError, Result};
use crate::mechanisms::{build_row, MechanismRegistry};
use crate::solver::SolverConfig;

/// Default membrane capacitance of a node (nF).
pub const DEFAULT_CM: f64 = 1.0;

/// Default initial potential (mV).
pub const DEFAULT_V: f64 = -65.0;

/// Layers per node when `ext=1` is used without `.extracellular`.
const DEFAULT_EXT_LAYERS: usize = 1;

/// A node whose potential is recorded and printed.
#[derive(Debug, Clone, PartialEq)]
pub struct Probe {
    pub name: String,
    pub partition: usize,
    pub node: NodeId,
}

/// A complete model ready for assembly.
#[derive(Debug)]
pub struct Model {
    pub partitions: Vec<Partition>,
    pub registry: MechanismRegistry,
    pub config: SolverConfig,
    pub probes: Vec<Probe>,
    /// Node name to (partition, node)
    pub node_map: HashMap<String, (usize, NodeId)>,
}

impl Model {
    /// Build a model with the built-in mechanism registry.
    pub fn from_ast(ast: &ModelAst) -> Result<Self> {
        Self::with_registry(ast, MechanismRegistry::builtin())
    }

    /// Build a model from a parsed AST, resolving mechanisms in `registry`.
    pub fn with_registry(ast: &ModelAst, registry: MechanismRegistry) -> Result<Self> {
        let mut config = SolverConfig::new();
        let mut probe_names = Vec::new();
        let mut ext_layers = None;
        for def in &ast.directives {
            config = match &def.directive {
                Directive::Atol(v) => config.with_atol(*v),
                Directive::Vtol(v) => config.with_voltage_tolerance(*v),
                Directive::Stiff(s) => config.with_stiffness(*s),
                Directive::Layout(mode) => config.with_layout(*mode),
                Directive::Threads(n) => config.with_threads(*n),
                Directive::Dt(v) => config.with_dt(*v),
                Directive::Tstop(v) => config.with_tstop(*v),
                Directive::Extracellular(n) => {
                    ext_layers = Some(*n);
                    config
                }
                Directive::Probe(name) => {
                    probe_names.push(name.clone());
                    config
                }
            };
        }
        config.validate()?;

        let placement = place_nodes(&ast.nodes, config.threads)?;
        let npart = config.threads;
        let mut partitions: Vec<Partition> = (0..npart).map(|i| Partition::new(PartitionId(i))).collect();

        // Roots first in each partition, then the rest in declaration order,
        // which keeps every parent ahead of its children.
        let mut node_map: HashMap<String, (usize, NodeId)> = HashMap::new();
        let mut ext_flags: Vec<Vec<bool>> = vec![Vec::new(); npart];
        for pass_roots in [true, false] {
            for (def, &part) in ast.nodes.iter().zip(&placement) {
                if def.parent.is_none() != pass_roots {
                    continue;
                }
                let partition = &mut partitions[part];
                let cm = def.cm.unwrap_or(DEFAULT_CM);
                let v = def.v.unwrap_or(DEFAULT_V);
                let id = match &def.parent {
                    None => {
                        if def.g.is_some() {
                            return Err(DendriteError::topology(format!(
                                "root '{}' cannot have an axial conductance",
                                def.name
                            )));
                        }
                        partition.nodes.push_root(cm, v, def.split.map(SplitKey))
                    }
                    Some(parent) => {
                        if def.split.is_some() {
                            return Err(DendriteError::topology(format!(
                                "only roots can be split, '{}' has parent '{}'",
                                def.name, parent
                            )));
                        }
                        let g = def.g.ok_or_else(|| {
                            DendriteError::topology(format!("node '{}' needs an axial conductance g=", def.name))
                        })?;
                        let &(_, pid) = node_map
                            .get(parent)
                            .ok_or_else(|| DendriteError::NodeNotFound { node: parent.clone() })?;
                        partition.nodes.push_child(pid, g, cm, v)
                    }
                };
                partition.node_names.push(def.name.clone());
                ext_flags[part].push(def.ext);
                node_map.insert(def.name.clone(), (part, id));
            }
        }

        if ast.nodes.iter().any(|n| n.ext) || ext_layers.is_some() {
            let nlayer = ext_layers.unwrap_or(DEFAULT_EXT_LAYERS);
            for (partition, flags) in partitions.iter_mut().zip(&ext_flags) {
                partition.nodes.attach_extracellular(nlayer, flags);
            }
        }

        let mut instance_names = std::collections::HashSet::new();
        for def in &ast.mechanisms {
            let type_id = registry
                .lookup(&def.keyword)
                .ok_or_else(|| DendriteError::UnknownMechanism {
                    mechanism: def.keyword.clone(),
                    line: def.line,
                })?;
            if !instance_names.insert(def.name.as_str()) {
                return Err(DendriteError::DuplicateInstance { name: def.name.clone() });
            }
            let &(part, node) = node_map
                .get(&def.node)
                .ok_or_else(|| DendriteError::NodeNotFound { node: def.node.clone() })?;
            let mechanism = registry
                .get(type_id)
                .ok_or_else(|| DendriteError::invalid_instance(&def.name, def.line, "mechanism type vanished"))?;
            let row = build_row(mechanism.as_ref(), &def.name, &def.params)?;
            partitions[part].insert_instance(type_id, mechanism, node, def.name.clone(), &row);
        }

        let probes = probe_names
            .into_iter()
            .map(|name| {
                let &(partition, node) = node_map
                    .get(&name)
                    .ok_or_else(|| DendriteError::NodeNotFound { node: name.clone() })?;
                Ok(Probe { name, partition, node })
            })
            .collect::<Result<Vec<_>>>()?;

        let model = Model {
            partitions,
            registry,
            config,
            probes,
            node_map,
        };
        validate_model(&model)?;
        Ok(model)
    }

    /// Find a node by name.
    pub fn find_node(&self, name: &str) -> Option<(usize, NodeId)> {
        self.node_map.get(name).copied()
    }

    /// Total number of nodes over all partitions.
    pub fn node_count(&self) -> usize {
        self.partitions.iter().map(|p| p.nodes.len()).sum()
    }
}

/// Assign each declared node to one of `threads` partitions. Trees stay
/// whole: a root takes its `part=` or the next partition round-robin,
/// children follow their root.
fn place_nodes(nodes: &[NodeDef], threads: usize) -> Result<Vec<usize>> {
    let threads = threads.max(1);
    let mut index: HashMap<&str, usize> = HashMap::new();
    let mut placement = Vec::with_capacity(nodes.len());
    let mut next = 0usize;
    for (i, def) in nodes.iter().enumerate() {
        if index.insert(def.name.as_str(), i).is_some() {
            return Err(DendriteError::DuplicateNode { name: def.name.clone() });
        }
        if let Some(p) = def.part.filter(|&p| p >= threads) {
            return Err(DendriteError::config(format!(
                "node '{}' has part={} but there are only {} partitions (set .threads)",
                def.name, p, threads
            )));
        }
        let part = match &def.parent {
            None => def.part.unwrap_or_else(|| {
                let p = next % threads;
                next += 1;
                p
            }),
            Some(parent) => {
                // Parents must be declared first, so their placement is known.
                let &pi = index
                    .get(parent.as_str())
                    .filter(|&&pi| pi != i)
                    .ok_or_else(|| DendriteError::NodeNotFound { node: parent.clone() })?;
                let inherited = placement[pi];
                if let Some(p) = def.part {
                    if p != inherited {
                        return Err(DendriteError::topology(format!(
                            "node '{}' has part={} but its tree is in partition {}",
                            def.name, p, inherited
                        )));
                    }
                }
                inherited
            }
        };
        placement.push(part);
    }
    Ok(placement)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dsl::parse;
    use crate::model::Handle;

    #[test]
    fn test_build_ball_and_stick() {
        let ast = parse(
            "node soma\nnode dend soma g=0.5 cm=0\npas leak dend g=0.01\nhh hh1 soma\n.probe dend\n",
        )
        .unwrap();
        let model = Model::from_ast(&ast).unwrap();
        assert_eq!(model.partitions.len(), 1);
        let p = &model.partitions[0];
        assert_eq!(p.node_names, vec!["soma", "dend"]);
        assert_eq!(p.nodes.cm, vec![DEFAULT_CM, 0.0]);
        assert_eq!(p.mech_lists.len(), 2);
        assert_eq!(model.probes[0].node, NodeId(1));
        assert_eq!(p.field_handle("leak", "g").map(|h| p.get(h)), Some(Some(0.01)));
        assert!(matches!(p.field_handle("hh1", "m"), Some(Handle::Field { list: 1, .. })));
    }

    #[test]
    fn test_roots_precede_children() {
        let ast = parse("node a\nnode b a g=1\nnode c\nnode d b g=1").unwrap();
        let model = Model::from_ast(&ast).unwrap();
        let p = &model.partitions[0];
        assert_eq!(p.node_names, vec!["a", "c", "b", "d"]);
        assert_eq!(p.nodes.root_end, 2);
        assert_eq!(p.nodes.parent, vec![None, None, Some(0), Some(2)]);
    }

    #[test]
    fn test_round_robin_placement() {
        let ast = parse(".threads 4\nnode a\nnode b\nnode c part=1\nnode a1 a g=1\nnode d").unwrap();
        let model = Model::from_ast(&ast).unwrap();
        assert_eq!(model.partitions.len(), 4);
        assert_eq!(model.find_node("a"), Some((0, NodeId(0))));
        assert_eq!(model.find_node("b"), Some((1, NodeId(0))));
        assert_eq!(model.find_node("c"), Some((1, NodeId(1))));
        assert_eq!(model.find_node("a1"), Some((0, NodeId(1))));
        assert_eq!(model.find_node("d"), Some((2, NodeId(0))));
        assert!(model.partitions[3].is_empty());
    }

    #[test]
    fn test_construction_errors() {
        let build = |src: &str| Model::from_ast(&parse(src).unwrap());
        assert!(matches!(build("node a\nnode a"), Err(DendriteError::DuplicateNode { .. })));
        assert!(matches!(build("node b a g=1\nnode a"), Err(DendriteError::NodeNotFound { .. })));
        assert!(matches!(build("node a\nnode b a"), Err(DendriteError::InvalidTopology { .. })));
        assert!(matches!(build("node a\nkdr k a"), Err(DendriteError::UnknownMechanism { line: 2, .. })));
        assert!(matches!(build("node a\npas p a\npas p a"), Err(DendriteError::DuplicateInstance { .. })));
        assert!(matches!(build("node a\npas p a gbar=1"), Err(DendriteError::InvalidParameter { .. })));
        assert!(matches!(build("node a\n.probe b"), Err(DendriteError::NodeNotFound { .. })));
        assert!(matches!(
            build(".threads 2\nnode a part=0\nnode b a g=1 part=1"),
            Err(DendriteError::InvalidTopology { .. })
        ));
        assert!(matches!(build("node a part=1"), Err(DendriteError::InvalidConfig { .. })));
        assert!(matches!(
            build(".threads 2\nnode a part=100000"),
            Err(DendriteError::InvalidConfig { .. })
        ));
    }

    #[test]
    fn test_extracellular_flags() {
        let ast = parse(".extracellular 2\n.layout implicit\nnode a ext=1\nnode b a g=1").unwrap();
        let model = Model::from_ast(&ast).unwrap();
        let ext = model.partitions[0].nodes.ext.as_ref().unwrap();
        assert_eq!(ext.nlayer, 2);
        assert_eq!(ext.present, vec![true, false]);
    }
}
