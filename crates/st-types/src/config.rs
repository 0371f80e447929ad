//! Hierarchical hyperparameter configuration spaces.
//!
//! Names are colon-namespaced (`"_model:ridge_log10"`). A space is built by
//! nesting sub-spaces under a prefix, optionally conditioned on a parent
//! categorical value; a [`Configuration`] assigns a value to every *active*
//! hyperparameter of its space.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::errors::{ConfigurationError, SearchError};

/// Separator between namespace prefix and hyperparameter name.
pub const DELIMITER: &str = ":";

/// A concrete hyperparameter value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Int(i64),
    Float(f64),
    Str(String),
}

impl ParamValue {
    fn type_name(&self) -> &'static str {
        match self {
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::Str(_) => "string",
        }
    }
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Float(v) => write!(f, "{v}"),
            Self::Int(v) => write!(f, "{v}"),
            Self::Str(v) => write!(f, "'{v}'"),
        }
    }
}

/// Describes the domain of a hyperparameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ParameterKind {
    /// Continuous range [low, high], optionally sampled in log-space.
    Float { low: f64, high: f64, log: bool },
    /// Integer range [low, high] inclusive.
    Int { low: i64, high: i64 },
    /// Named choices.
    Categorical { choices: Vec<String> },
}

/// A single named dimension of the space.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hyperparameter {
    pub name: String,
    pub kind: ParameterKind,
    pub default: ParamValue,
}

impl Hyperparameter {
    /// Check that `value` lies in this hyperparameter's domain.
    pub fn check(&self, value: &ParamValue) -> Result<(), ConfigurationError> {
        let mismatch = |expected: &str| ConfigurationError::TypeMismatch {
            name: self.name.clone(),
            expected: expected.to_string(),
            actual: value.type_name().to_string(),
        };
        match (&self.kind, value) {
            (ParameterKind::Float { low, high, .. }, ParamValue::Float(v)) => {
                if v.is_finite() && *v >= *low && *v <= *high {
                    Ok(())
                } else {
                    Err(ConfigurationError::OutOfRange {
                        name: self.name.clone(),
                        value: *v,
                        low: *low,
                        high: *high,
                    })
                }
            }
            (ParameterKind::Float { .. }, _) => Err(mismatch("float")),
            (ParameterKind::Int { low, high }, ParamValue::Int(v)) => {
                if v >= low && v <= high {
                    Ok(())
                } else {
                    Err(ConfigurationError::OutOfRange {
                        name: self.name.clone(),
                        value: *v as f64,
                        low: *low as f64,
                        high: *high as f64,
                    })
                }
            }
            (ParameterKind::Int { .. }, _) => Err(mismatch("int")),
            (ParameterKind::Categorical { choices }, ParamValue::Str(v)) => {
                if choices.contains(v) {
                    Ok(())
                } else {
                    Err(ConfigurationError::InvalidChoice {
                        name: self.name.clone(),
                        value: v.clone(),
                        choices: choices.clone(),
                    })
                }
            }
            (ParameterKind::Categorical { .. }, _) => Err(mismatch("string")),
        }
    }

    fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> ParamValue {
        match &self.kind {
            ParameterKind::Float { low, high, log: false } => {
                ParamValue::Float(rng.gen_range(*low..=*high))
            }
            ParameterKind::Float { low, high, log: true } => {
                let log_val: f64 = rng.gen_range(low.ln()..=high.ln());
                ParamValue::Float(log_val.exp().clamp(*low, *high))
            }
            ParameterKind::Int { low, high } => ParamValue::Int(rng.gen_range(*low..=*high)),
            ParameterKind::Categorical { choices } => {
                ParamValue::Str(choices[rng.gen_range(0..choices.len())].clone())
            }
        }
    }

    /// Move `value` by a random step of at most `scale` of the domain width.
    fn perturb<R: Rng + ?Sized>(&self, value: &ParamValue, rng: &mut R, scale: f64) -> ParamValue {
        match (&self.kind, value) {
            (ParameterKind::Float { low, high, log: false }, ParamValue::Float(v)) => {
                let noise = rng.gen_range(-scale..=scale) * (high - low);
                ParamValue::Float((v + noise).clamp(*low, *high))
            }
            (ParameterKind::Float { low, high, log: true }, ParamValue::Float(v)) => {
                let log_range = high.ln() - low.ln();
                let noise = rng.gen_range(-scale..=scale) * log_range;
                ParamValue::Float((v.ln() + noise).exp().clamp(*low, *high))
            }
            (ParameterKind::Int { low, high }, ParamValue::Int(v)) => {
                let step = (((high - low) as f64 * scale).round() as i64).max(1);
                let delta: i64 = rng.gen_range(-step..=step);
                ParamValue::Int((v + delta).clamp(*low, *high))
            }
            (ParameterKind::Categorical { .. }, current) => {
                if rng.gen::<f64>() < scale {
                    self.sample(rng)
                } else {
                    current.clone()
                }
            }
            // Ill-typed values fall back to a fresh draw.
            _ => self.sample(rng),
        }
    }
}

/// `child` is active only while `parent` holds the categorical `value`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    pub child: String,
    pub parent: String,
    pub value: String,
}

/// The full search space: ordered hyperparameters plus activation conditions.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ConfigSpace {
    pub hyperparameters: Vec<Hyperparameter>,
    pub conditions: Vec<Condition>,
}

impl ConfigSpace {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(mut self, name: impl Into<String>, kind: ParameterKind, default: ParamValue) -> Self {
        self.hyperparameters.push(Hyperparameter {
            name: name.into(),
            kind,
            default,
        });
        self
    }

    pub fn add_float(self, name: impl Into<String>, low: f64, high: f64, default: f64) -> Self {
        self.push(
            name,
            ParameterKind::Float { low, high, log: false },
            ParamValue::Float(default),
        )
    }

    pub fn add_log_float(self, name: impl Into<String>, low: f64, high: f64, default: f64) -> Self {
        self.push(
            name,
            ParameterKind::Float { low, high, log: true },
            ParamValue::Float(default),
        )
    }

    pub fn add_int(self, name: impl Into<String>, low: i64, high: i64, default: i64) -> Self {
        self.push(name, ParameterKind::Int { low, high }, ParamValue::Int(default))
    }

    pub fn add_categorical(self, name: impl Into<String>, choices: &[&str], default: &str) -> Self {
        self.push(
            name,
            ParameterKind::Categorical {
                choices: choices.iter().map(|c| c.to_string()).collect(),
            },
            ParamValue::Str(default.to_string()),
        )
    }

    pub fn add_condition(mut self, child: &str, parent: &str, value: &str) -> Self {
        self.conditions.push(Condition {
            child: child.to_string(),
            parent: parent.to_string(),
            value: value.to_string(),
        });
        self
    }

    /// Nest `space` under `prefix`. With a `parent` of `(name, value)`, every
    /// top-level hyperparameter of the nested space becomes active only when
    /// `name == value`.
    pub fn add_subspace(mut self, prefix: &str, space: ConfigSpace, parent: Option<(&str, &str)>) -> Self {
        let rename = |name: &str| format!("{prefix}{DELIMITER}{name}");
        let nested_children: Vec<String> = space.conditions.iter().map(|c| rename(&c.child)).collect();

        for hp in space.hyperparameters {
            let name = rename(&hp.name);
            if let Some((parent_name, parent_value)) = parent {
                if !nested_children.contains(&name) {
                    self.conditions.push(Condition {
                        child: name.clone(),
                        parent: parent_name.to_string(),
                        value: parent_value.to_string(),
                    });
                }
            }
            self.hyperparameters.push(Hyperparameter { name, ..hp });
        }
        for cond in space.conditions {
            self.conditions.push(Condition {
                child: rename(&cond.child),
                parent: rename(&cond.parent),
                value: cond.value,
            });
        }
        self
    }

    /// Copy of this space with every hyperparameter under `prefix` removed.
    pub fn without_prefix(&self, prefix: &str) -> Self {
        let scoped = format!("{prefix}{DELIMITER}");
        let keep = |name: &str| !name.starts_with(&scoped);
        Self {
            hyperparameters: self
                .hyperparameters
                .iter()
                .filter(|hp| keep(&hp.name))
                .cloned()
                .collect(),
            conditions: self
                .conditions
                .iter()
                .filter(|c| keep(&c.child) && keep(&c.parent))
                .cloned()
                .collect(),
        }
    }

    pub fn get(&self, name: &str) -> Option<&Hyperparameter> {
        self.hyperparameters.iter().find(|hp| hp.name == name)
    }

    pub fn len(&self) -> usize {
        self.hyperparameters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hyperparameters.is_empty()
    }

    /// Structural check of the space itself.
    pub fn validate_definition(&self) -> Result<(), SearchError> {
        if self.hyperparameters.is_empty() {
            return Err(SearchError::EmptySpace);
        }
        let invalid = |message: String| Err(SearchError::InvalidSpace { message });

        for (i, hp) in self.hyperparameters.iter().enumerate() {
            if self.hyperparameters[..i].iter().any(|other| other.name == hp.name) {
                return invalid(format!("duplicate hyperparameter {}", hp.name));
            }
            match &hp.kind {
                ParameterKind::Float { low, high, log } => {
                    if !(low.is_finite() && high.is_finite() && low < high) {
                        return invalid(format!("{}: bad range [{low}, {high}]", hp.name));
                    }
                    if *log && *low <= 0.0 {
                        return invalid(format!("{}: log range must be positive", hp.name));
                    }
                }
                ParameterKind::Int { low, high } if low > high => {
                    return invalid(format!("{}: bad range [{low}, {high}]", hp.name));
                }
                ParameterKind::Categorical { choices } if choices.is_empty() => {
                    return invalid(format!("{}: no choices", hp.name));
                }
                _ => {}
            }
            if let Err(e) = hp.check(&hp.default) {
                return invalid(format!("default rejected: {e}"));
            }
        }

        for cond in &self.conditions {
            if self.get(&cond.child).is_none() {
                return invalid(format!("condition on unknown child {}", cond.child));
            }
            match self.get(&cond.parent).map(|hp| &hp.kind) {
                Some(ParameterKind::Categorical { choices }) if choices.contains(&cond.value) => {}
                Some(_) => {
                    return invalid(format!(
                        "condition parent {} cannot take value {}",
                        cond.parent, cond.value
                    ))
                }
                None => return invalid(format!("condition on unknown parent {}", cond.parent)),
            }
        }
        Ok(())
    }

    fn conditions_hold(&self, name: &str, values: &BTreeMap<String, ParamValue>) -> bool {
        self.conditions
            .iter()
            .filter(|c| c.child == name)
            .all(|c| matches!(values.get(&c.parent), Some(ParamValue::Str(v)) if *v == c.value))
    }

    /// Whether `name` is active given the (partial) assignment in `cfg`.
    pub fn is_active(&self, name: &str, cfg: &Configuration) -> bool {
        self.get(name).is_some() && self.conditions_hold(name, &cfg.values)
    }

    /// Assign values parents-first so conditional children see their
    /// parent's final value.
    fn resolve<F>(&self, mut pick: F) -> Configuration
    where
        F: FnMut(&Hyperparameter) -> ParamValue,
    {
        let mut values = BTreeMap::new();
        loop {
            let mut changed = false;
            for hp in &self.hyperparameters {
                if !values.contains_key(&hp.name) && self.conditions_hold(&hp.name, &values) {
                    let value = pick(hp);
                    values.insert(hp.name.clone(), value);
                    changed = true;
                }
            }
            if !changed {
                break;
            }
        }
        Configuration { values }
    }

    pub fn default_configuration(&self) -> Configuration {
        self.resolve(|hp| hp.default.clone())
    }

    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> Configuration {
        self.resolve(|hp| hp.sample(rng))
    }

    /// Neighbour of `cfg`; newly activated hyperparameters take defaults.
    pub fn perturb<R: Rng + ?Sized>(&self, cfg: &Configuration, rng: &mut R, scale: f64) -> Configuration {
        self.resolve(|hp| match cfg.get(&hp.name) {
            Some(value) => hp.perturb(value, rng, scale),
            None => hp.default.clone(),
        })
    }

    /// Check that `cfg` assigns exactly the active hyperparameters, each
    /// within its domain.
    pub fn validate(&self, cfg: &Configuration) -> Result<(), ConfigurationError> {
        for (name, value) in &cfg.values {
            let hp = self
                .get(name)
                .ok_or_else(|| ConfigurationError::UnknownHyperparameter { name: name.clone() })?;
            if !self.conditions_hold(name, &cfg.values) {
                return Err(ConfigurationError::InactiveHyperparameter { name: name.clone() });
            }
            hp.check(value)?;
        }
        for hp in &self.hyperparameters {
            if !cfg.values.contains_key(&hp.name) && self.conditions_hold(&hp.name, &cfg.values) {
                return Err(ConfigurationError::MissingHyperparameter {
                    name: hp.name.clone(),
                });
            }
        }
        Ok(())
    }
}

/// Immutable assignment of values to hyperparameter names.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Configuration {
    values: BTreeMap<String, ParamValue>,
}

impl Configuration {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy with `name` set to `value`.
    pub fn with(mut self, name: impl Into<String>, value: ParamValue) -> Self {
        self.values.insert(name.into(), value);
        self
    }

    pub fn get(&self, name: &str) -> Option<&ParamValue> {
        self.values.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ParamValue)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v))
    }

    fn require(&self, name: &str) -> Result<&ParamValue, ConfigurationError> {
        self.values
            .get(name)
            .ok_or_else(|| ConfigurationError::MissingHyperparameter {
                name: name.to_string(),
            })
    }

    fn mismatch(name: &str, expected: &str, actual: &ParamValue) -> ConfigurationError {
        ConfigurationError::TypeMismatch {
            name: name.to_string(),
            expected: expected.to_string(),
            actual: actual.type_name().to_string(),
        }
    }

    pub fn float(&self, name: &str) -> Result<f64, ConfigurationError> {
        match self.require(name)? {
            ParamValue::Float(v) => Ok(*v),
            other => Err(Self::mismatch(name, "float", other)),
        }
    }

    pub fn int(&self, name: &str) -> Result<i64, ConfigurationError> {
        match self.require(name)? {
            ParamValue::Int(v) => Ok(*v),
            other => Err(Self::mismatch(name, "int", other)),
        }
    }

    pub fn string(&self, name: &str) -> Result<&str, ConfigurationError> {
        match self.require(name)? {
            ParamValue::Str(v) => Ok(v.as_str()),
            other => Err(Self::mismatch(name, "string", other)),
        }
    }

    /// Values under `prefix`, with the prefix stripped.
    pub fn subconfiguration(&self, prefix: &str) -> Configuration {
        let scoped = format!("{prefix}{DELIMITER}");
        Self {
            values: self
                .values
                .iter()
                .filter_map(|(k, v)| k.strip_prefix(&scoped).map(|rest| (rest.to_string(), v.clone())))
                .collect(),
        }
    }

    /// Copy with every value of `sub` written under `prefix`.
    pub fn with_subconfiguration(mut self, prefix: &str, sub: &Configuration) -> Self {
        for (k, v) in &sub.values {
            self.values.insert(format!("{prefix}{DELIMITER}{k}"), v.clone());
        }
        self
    }

    /// Copy with every name under `prefix` removed.
    pub fn without_prefix(&self, prefix: &str) -> Self {
        let scoped = format!("{prefix}{DELIMITER}");
        Self {
            values: self
                .values
                .iter()
                .filter(|(k, _)| !k.starts_with(&scoped))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        }
    }
}

impl fmt::Display for Configuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Configuration:")?;
        for (name, value) in &self.values {
            writeln!(f, "  {name}, Value: {value}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn model_space() -> ConfigSpace {
        ConfigSpace::new()
            .add_categorical("degree", &["1", "2"], "1")
            .add_float("ridge_log10", -6.0, 2.0, -3.0)
            .add_categorical("bootstrap", &["false", "true"], "false")
    }

    fn pipeline_space() -> ConfigSpace {
        let controller = ConfigSpace::new().add_int("horizon", 5, 50, 20);
        let gains = ConfigSpace::new()
            .add_float("x_log10Qgain", -2.0, 3.0, 0.0)
            .add_log_float("scale", 0.01, 10.0, 1.0);
        ConfigSpace::new()
            .add_categorical("transformer", &["quad", "none"], "quad")
            .add_subspace("_model", model_space(), None)
            .add_subspace("_controller", controller, None)
            .add_subspace("_task_transformer_0", gains, Some(("transformer", "quad")))
    }

    #[test]
    fn subspace_renames_and_conditions() {
        let space = pipeline_space();
        assert!(space.get("_model:ridge_log10").is_some());
        assert!(space.get("_controller:horizon").is_some());
        assert!(space.validate_definition().is_ok());

        let default = space.default_configuration();
        assert_eq!(default.int("_controller:horizon").unwrap(), 20);
        assert_eq!(default.float("_task_transformer_0:x_log10Qgain").unwrap(), 0.0);
        assert!(space.validate(&default).is_ok());

        let off = default
            .without_prefix("_task_transformer_0")
            .with("transformer", ParamValue::Str("none".into()));
        assert!(space.validate(&off).is_ok());
        assert!(!space.is_active("_task_transformer_0:scale", &off));
    }

    #[test]
    fn validate_reports_each_failure_kind() {
        let space = pipeline_space();
        let default = space.default_configuration();

        let missing = default.without_prefix("_controller");
        assert_eq!(
            space.validate(&missing),
            Err(ConfigurationError::MissingHyperparameter {
                name: "_controller:horizon".into()
            })
        );

        let unknown = default.clone().with("_controller:typo", ParamValue::Int(1));
        assert!(matches!(
            space.validate(&unknown),
            Err(ConfigurationError::UnknownHyperparameter { .. })
        ));

        let wrong_type = default.clone().with("_controller:horizon", ParamValue::Float(3.0));
        assert!(matches!(
            space.validate(&wrong_type),
            Err(ConfigurationError::TypeMismatch { .. })
        ));

        let out_of_range = default.clone().with("_controller:horizon", ParamValue::Int(500));
        assert!(matches!(
            space.validate(&out_of_range),
            Err(ConfigurationError::OutOfRange { .. })
        ));

        let inactive = default.with("transformer", ParamValue::Str("none".into()));
        assert!(matches!(
            space.validate(&inactive),
            Err(ConfigurationError::InactiveHyperparameter { .. })
        ));
    }

    #[test]
    fn sample_and_perturb_stay_valid() {
        let space = pipeline_space();
        let mut rng = ChaCha8Rng::seed_from_u64(11);
        for _ in 0..50 {
            let cfg = space.sample(&mut rng);
            assert!(space.validate(&cfg).is_ok(), "{cfg}");
            let near = space.perturb(&cfg, &mut rng, 0.2);
            assert!(space.validate(&near).is_ok(), "{near}");
        }
    }

    #[test]
    fn sampling_is_seeded() {
        let space = pipeline_space();
        let a = space.sample(&mut ChaCha8Rng::seed_from_u64(3));
        let b = space.sample(&mut ChaCha8Rng::seed_from_u64(3));
        assert_eq!(a, b);
    }

    #[test]
    fn prefix_merge_and_extract() {
        let root = pipeline_space().default_configuration();
        let candidate = Configuration::new().with("horizon", ParamValue::Int(30));

        let merged = root.with_subconfiguration("_controller", &candidate);
        assert_eq!(merged.int("_controller:horizon").unwrap(), 30);
        assert_eq!(merged.subconfiguration("_controller"), candidate);
        assert_eq!(
            merged.subconfiguration("_model").string("degree").unwrap(),
            "1"
        );
    }

    #[test]
    fn malformed_spaces_are_rejected() {
        assert_eq!(ConfigSpace::new().validate_definition(), Err(SearchError::EmptySpace));

        let inverted = ConfigSpace::new().add_float("x", 1.0, 0.0, 0.5);
        assert!(matches!(
            inverted.validate_definition(),
            Err(SearchError::InvalidSpace { .. })
        ));

        let bad_default = ConfigSpace::new().add_int("n", 0, 3, 9);
        assert!(bad_default.validate_definition().is_err());

        let dangling = ConfigSpace::new()
            .add_int("n", 0, 3, 1)
            .add_condition("n", "missing", "on");
        assert!(dangling.validate_definition().is_err());
    }

    #[test]
    fn display_lists_values() {
        let cfg = Configuration::new()
            .with("_controller:horizon", ParamValue::Int(25))
            .with("_model:degree", ParamValue::Str("2".into()));
        let text = cfg.to_string();
        assert!(text.starts_with("Configuration:"));
        assert!(text.contains("_controller:horizon, Value: 25"));
        assert!(text.contains("_model:degree, Value: '2'"));
    }
}
