use anyhow::{bail, Result};
use std::collections::{BTreeMap, BTreeSet};

pub type Map = BTreeMap<String, String>;

/// A namespace selector from a listener's `allowedRoutes`.
///
/// All labels and all requirements must match. A selector that failed to
/// parse selects nothing.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct Selector {
    labels: Map,
    requirements: Vec<Requirement>,
    invalid: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Requirement {
    key: String,
    op: Op,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
enum Op {
    In(BTreeSet<String>),
    NotIn(BTreeSet<String>),
    Exists,
    DoesNotExist,
}

// === impl Selector ===

impl Selector {
    pub fn new(labels: Map, requirements: Vec<Requirement>) -> Self {
        Self {
            labels,
            requirements,
            invalid: false,
        }
    }

    /// A selector that matches no namespace.
    pub fn invalid() -> Self {
        Self {
            invalid: true,
            ..Default::default()
        }
    }

    pub fn matches(&self, labels: Option<&Map>) -> bool {
        if self.invalid {
            return false;
        }
        let empty = Map::new();
        let labels = labels.unwrap_or(&empty);
        self.labels.iter().all(|(k, v)| labels.get(k) == Some(v))
            && self.requirements.iter().all(|r| r.matches(labels))
    }
}

impl<'a> FromIterator<(&'a str, &'a str)> for Selector {
    fn from_iter<T: IntoIterator<Item = (&'a str, &'a str)>>(iter: T) -> Self {
        let labels = iter
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Self::new(labels, vec![])
    }
}

// === impl Requirement ===

impl Requirement {
    pub fn parse(key: impl Into<String>, operator: &str, values: Vec<String>) -> Result<Self> {
        let values = values.into_iter().collect::<BTreeSet<_>>();
        let op = match operator {
            "In" | "NotIn" if values.is_empty() => {
                bail!("{operator} requires at least one value")
            }
            "In" => Op::In(values),
            "NotIn" => Op::NotIn(values),
            "Exists" => Op::Exists,
            "DoesNotExist" => Op::DoesNotExist,
            op => bail!("unsupported label selector operator: {op}"),
        };
        Ok(Self {
            key: key.into(),
            op,
        })
    }

    fn matches(&self, labels: &Map) -> bool {
        let value = labels.get(&self.key);
        match &self.op {
            Op::In(values) => value.is_some_and(|v| values.contains(v)),
            Op::NotIn(values) => value.map_or(true, |v| !values.contains(v)),
            Op::Exists => value.is_some(),
            Op::DoesNotExist => value.is_none(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels() -> Map {
        [("env", "prod"), ("team", "edge")]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn requirement(key: &str, op: &str, values: &[&str]) -> Requirement {
        Requirement::parse(key, op, values.iter().map(|v| v.to_string()).collect()).unwrap()
    }

    #[test]
    fn matches_labels_and_requirements() {
        let labels = labels();
        assert!(Selector::default().matches(Some(&labels)));
        assert!(Selector::default().matches(None));
        assert!([("env", "prod")].into_iter().collect::<Selector>().matches(Some(&labels)));
        assert!(![("env", "dev")].into_iter().collect::<Selector>().matches(Some(&labels)));

        let sel = |r| Selector::new(Map::new(), vec![r]);
        assert!(sel(requirement("env", "In", &["prod", "stage"])).matches(Some(&labels)));
        assert!(sel(requirement("env", "NotIn", &["dev"])).matches(Some(&labels)));
        assert!(sel(requirement("tier", "NotIn", &["dev"])).matches(Some(&labels)));
        assert!(!sel(requirement("tier", "Exists", &[])).matches(Some(&labels)));
        assert!(sel(requirement("tier", "DoesNotExist", &[])).matches(None));
    }

    #[test]
    fn invalid_selectors_match_nothing() {
        assert!(Requirement::parse("env", "Like", vec![]).is_err());
        assert!(Requirement::parse("env", "In", vec![]).is_err());
        assert!(!Selector::invalid().matches(Some(&labels())));
        assert!(!Selector::invalid().matches(None));
    }
}
