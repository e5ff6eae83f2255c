//! nswarden policy store: ordered reconciliation rules loaded once at
//! startup from a YAML file and read-only thereafter.
//!
//! A rule pairs a predicate over namespace attributes with a corrective
//! mutation. Evaluation is first-match in declaration order; the mutation
//! defines the desired state for matching objects.
//!
//! ```yaml
//! rules:
//!   - name: prod-ownership
//!     match:
//!       labels:
//!         env: prod
//!     set:
//!       labels:
//!         team: platform
//!     remove:
//!       annotations: [legacy.example.com/owner]
//! ```

#![forbid(unsafe_code)]

use std::path::Path;

use anyhow::{bail, Context, Result};
use nswarden_core::{Attrs, NsObject};
use serde::Deserialize;
use tracing::info;

/// Predicate over object attributes. Empty `labels` matches every object.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
pub struct Match {
    #[serde(default)]
    pub labels: Attrs,
}

impl Match {
    fn matches(&self, obj: &NsObject) -> bool {
        self.labels
            .iter()
            .all(|(k, v)| obj.labels.get(k) == Some(v))
    }
}

/// Attributes a matching rule requires to be present with given values.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
pub struct Set {
    #[serde(default)]
    pub labels: Attrs,
    #[serde(default)]
    pub annotations: Attrs,
}

/// Attribute keys a matching rule requires to be absent.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
pub struct Remove {
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default)]
    pub annotations: Vec<String>,
}

/// One reconciliation rule. Order of declaration is the tie-break: the first
/// rule whose predicate matches wins.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct Rule {
    pub name: String,
    #[serde(default, rename = "match")]
    pub matcher: Match,
    #[serde(default)]
    pub set: Set,
    #[serde(default)]
    pub remove: Remove,
}

impl Rule {
    pub fn matches(&self, obj: &NsObject) -> bool {
        self.matcher.matches(obj)
    }

    /// Desired state for `obj` under this rule. Pure function of (rule, obj)
    /// so repeated evaluation of the same snapshot converges.
    pub fn desired(&self, obj: &NsObject) -> NsObject {
        let mut out = obj.clone();
        for (k, v) in &self.set.labels {
            out.labels.insert(k.clone(), v.clone());
        }
        for (k, v) in &self.set.annotations {
            out.annotations.insert(k.clone(), v.clone());
        }
        for k in &self.remove.labels {
            out.labels.remove(k);
        }
        for k in &self.remove.annotations {
            out.annotations.remove(k);
        }
        out
    }
}

#[derive(Debug, Default, Deserialize)]
struct PolicyFile {
    #[serde(default)]
    rules: Vec<Rule>,
}

/// Validated, ordered rule set. Immutable after load.
#[derive(Debug, Clone, Default)]
pub struct Policy {
    rules: Vec<Rule>,
}

impl Policy {
    /// Load and validate a policy file. Any failure here is a startup-time
    /// hard error; callers abort the process rather than run degraded.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading policy file {}", path.display()))?;
        let policy = Self::from_yaml(&text)
            .with_context(|| format!("parsing policy file {}", path.display()))?;
        info!(rules = policy.rules.len(), path = %path.display(), "policy loaded");
        Ok(policy)
    }

    pub fn from_yaml(text: &str) -> Result<Self> {
        let file: PolicyFile = serde_yaml::from_str(text).context("invalid YAML")?;
        let policy = Self { rules: file.rules };
        policy.validate()?;
        Ok(policy)
    }

    fn validate(&self) -> Result<()> {
        for (i, rule) in self.rules.iter().enumerate() {
            if rule.name.is_empty() {
                bail!("rule #{} has an empty name", i + 1);
            }
            if self.rules[..i].iter().any(|r| r.name == rule.name) {
                bail!("duplicate rule name: {}", rule.name);
            }
            if let Some(k) = rule.remove.labels.iter().find(|k| rule.set.labels.contains_key(*k)) {
                bail!("rule {}: label {:?} is both set and removed", rule.name, k);
            }
            if let Some(k) = rule
                .remove
                .annotations
                .iter()
                .find(|k| rule.set.annotations.contains_key(*k))
            {
                bail!("rule {}: annotation {:?} is both set and removed", rule.name, k);
            }
        }
        Ok(())
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    /// First rule whose predicate matches, in declaration order.
    pub fn first_match(&self, obj: &NsObject) -> Option<&Rule> {
        self.rules.iter().find(|r| r.matches(obj))
    }
}
