//! Model validation.

use std::collections::HashMap;

use super::{Model, SplitKey};
use crate::error::{DendriteError, Result};

/// Validate a model for assembly.
///
/// Checks:
/// - Capacitances are non-negative and axial conductances positive
/// - A split key names at most one root per partition
/// - All copies of a split root agree on being algebraic or capacitive
pub fn validate_model(model: &Model) -> Result<()> {
    let mut split_kind: HashMap<SplitKey, (bool, String)> = HashMap::new();

    for partition in &model.partitions {
        let nodes = &partition.nodes;
        for i in 0..nodes.len() {
            let name = partition.node_names.get(i).map_or("?", String::as_str);
            if !(nodes.cm[i] >= 0.0) {
                return Err(DendriteError::topology(format!(
                    "node '{}' has negative capacitance {}",
                    name, nodes.cm[i]
                )));
            }
            if !nodes.is_root(i) && !(-nodes.b[i] > 0.0) {
                return Err(DendriteError::topology(format!(
                    "node '{}' needs a positive axial conductance, got {}",
                    name, -nodes.b[i]
                )));
            }
        }

        let mut seen = HashMap::new();
        for i in 0..nodes.root_end {
            let Some(key) = nodes.split[i] else {
                continue;
            };
            let name = partition.node_names.get(i).cloned().unwrap_or_default();
            if let Some(other) = seen.insert(key, name.clone()) {
                return Err(DendriteError::topology(format!(
                    "split key {} used by '{}' and '{}' in partition {}",
                    key.0, other, name, partition.id
                )));
            }
            let capacitive = nodes.has_capacitance(i);
            match split_kind.get(&key) {
                Some((kind, other)) if *kind != capacitive => {
                    return Err(DendriteError::topology(format!(
                        "split copies '{}' and '{}' disagree on zero capacitance",
                        other, name
                    )));
                }
                Some(_) => {}
                None => {
                    split_kind.insert(key, (capacitive, name));
                }
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use crate::dsl::parse;
    use crate::error::DendriteError;
    use crate::model::Model;

    #[test]
    fn test_split_copies_across_partitions() {
        let ast = parse(".threads 2\nnode a part=0 split=1\nnode b part=1 split=1\nnode c a g=1").unwrap();
        assert!(Model::from_ast(&ast).is_ok());
    }

    #[test]
    fn test_split_key_reused_in_partition() {
        let ast = parse("node a split=1\nnode b split=1").unwrap();
        assert!(matches!(Model::from_ast(&ast), Err(DendriteError::InvalidTopology { .. })));
    }

    #[test]
    fn test_split_copies_disagree() {
        let ast = parse(".threads 2\nnode a part=0 split=1\nnode b part=1 split=1 cm=0").unwrap();
        assert!(matches!(Model::from_ast(&ast), Err(DendriteError::InvalidTopology { .. })));
    }

    #[test]
    fn test_bad_coefficients() {
        let ast = parse("node a cm=-1").unwrap();
        assert!(Model::from_ast(&ast).is_err());
        let ast = parse("node a\nnode b a g=0").unwrap();
        assert!(Model::from_ast(&ast).is_err());
    }
}
