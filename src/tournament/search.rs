//! Parameter search spaces
//!
//! A search space maps parameter names to sampling specs:
//!
//! ```toml
//! [search_space.swappiness]
//! type = "int"
//! min = 0
//! max = 100
//!
//! [search_space.dirty_ratio]
//! type = "float"
//! min = 0.01
//! max = 0.5
//! log = true
//!
//! [search_space.scheduler]
//! type = "choice"
//! values = ["bfq", "mq-deadline", "none"]
//! ```

use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

pub type Params = BTreeMap<String, Value>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ParamSpec {
    Int {
        min: i64,
        max: i64,
    },
    Float {
        min: f64,
        max: f64,
        /// Sample uniformly in log space
        #[serde(default)]
        log: bool,
    },
    Choice {
        values: Vec<Value>,
    },
    Bool,
    Fixed {
        value: Value,
    },
}

impl ParamSpec {
    pub fn validate(&self) -> Result<(), String> {
        match self {
            ParamSpec::Int { min, max } if min > max => Err(format!("int range {}..={} is empty", min, max)),
            ParamSpec::Float { min, max, .. } if !(min.is_finite() && max.is_finite() && min <= max) => {
                Err(format!("float range {}..={} is invalid", min, max))
            }
            // the sampler needs a finite span
            ParamSpec::Float { min, max, .. } if !(max - min).is_finite() => {
                Err(format!("float range {}..={} is too wide to sample", min, max))
            }
            ParamSpec::Float { min, log: true, .. } if *min <= 0.0 => {
                Err("log-scaled float range must be positive".to_string())
            }
            ParamSpec::Choice { values } if values.is_empty() => Err("choice has no values".to_string()),
            _ => Ok(()),
        }
    }

    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> Value {
        match self {
            ParamSpec::Int { min, max } => Value::from(rng.gen_range(*min..=*max)),
            ParamSpec::Float { min, max, log } => {
                let x = if min == max {
                    *min
                } else if *log {
                    rng.gen_range(min.ln()..=max.ln()).exp().clamp(*min, *max)
                } else {
                    rng.gen_range(*min..=*max)
                };
                Value::from(x)
            }
            ParamSpec::Choice { values } => values.choose(rng).cloned().unwrap_or(Value::Null),
            ParamSpec::Bool => Value::Bool(rng.gen()),
            ParamSpec::Fixed { value } => value.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SearchSpace(BTreeMap<String, ParamSpec>);

impl SearchSpace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, spec: ParamSpec) -> Self {
        self.0.insert(name.into(), spec);
        self
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.0.is_empty() {
            return Err("search space is empty".to_string());
        }
        for (name, spec) in &self.0 {
            spec.validate().map_err(|e| format!("{}: {}", name, e))?;
        }
        Ok(())
    }

    /// Draw one parameter set
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> Params {
        self.0
            .iter()
            .map(|(name, spec)| (name.clone(), spec.sample(rng)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use serde_json::json;

    fn space() -> SearchSpace {
        SearchSpace::new()
            .with("swappiness", ParamSpec::Int { min: 0, max: 100 })
            .with(
                "dirty_ratio",
                ParamSpec::Float {
                    min: 0.01,
                    max: 0.5,
                    log: true,
                },
            )
            .with(
                "scheduler",
                ParamSpec::Choice {
                    values: vec![json!("bfq"), json!("none")],
                },
            )
            .with("thp", ParamSpec::Bool)
            .with("cooperation_style", ParamSpec::Fixed { value: json!("eager") })
    }

    #[test]
    fn test_samples_stay_in_range() {
        let space = space();
        let mut rng = StdRng::seed_from_u64(42);
        for _ in 0..200 {
            let params = space.sample(&mut rng);
            let swappiness = params["swappiness"].as_i64().unwrap();
            assert!((0..=100).contains(&swappiness));
            let ratio = params["dirty_ratio"].as_f64().unwrap();
            assert!((0.01..=0.5 + 1e-12).contains(&ratio));
            assert!(["bfq", "none"].contains(&params["scheduler"].as_str().unwrap()));
            assert!(params["thp"].is_boolean());
            assert_eq!(params["cooperation_style"], json!("eager"));
        }
    }

    #[test]
    fn test_deserializes_from_toml() {
        let space: SearchSpace = toml::from_str(
            r#"
            [swappiness]
            type = "int"
            min = 0
            max = 100

            [scheduler]
            type = "choice"
            values = ["bfq", "none"]
            "#,
        )
        .unwrap();
        assert_eq!(space.len(), 2);
        assert!(space.validate().is_ok());
    }

    #[test]
    fn test_validation() {
        assert!(SearchSpace::new().validate().is_err());

        let bad = SearchSpace::new().with("x", ParamSpec::Int { min: 5, max: 1 });
        assert!(bad.validate().unwrap_err().contains("x:"));

        let bad_log = SearchSpace::new().with(
            "y",
            ParamSpec::Float {
                min: 0.0,
                max: 1.0,
                log: true,
            },
        );
        assert!(bad_log.validate().is_err());

        let empty_choice = SearchSpace::new().with("z", ParamSpec::Choice { values: vec![] });
        assert!(empty_choice.validate().is_err());
    }

    #[test]
    fn test_overflowing_float_span_rejected() {
        let wide = SearchSpace::new().with(
            "w",
            ParamSpec::Float {
                min: -1e308,
                max: 1e308,
                log: false,
            },
        );
        assert!(wide.validate().unwrap_err().contains("too wide"));

        let huge_but_finite = SearchSpace::new().with(
            "w",
            ParamSpec::Float {
                min: 0.0,
                max: 1e308,
                log: false,
            },
        );
        assert!(huge_but_finite.validate().is_ok());
        let mut rng = StdRng::seed_from_u64(7);
        assert!(huge_but_finite.sample(&mut rng)["w"].as_f64().unwrap() >= 0.0);
    }
}
