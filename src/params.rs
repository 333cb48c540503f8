use std::collections::BTreeMap;
use std::str::FromStr;

use crate::errors::CommandError;

/// Pre-parsed parameters of an extended command. Parsing the command
/// line itself is the front-end's job; the planner core only consumes
/// this map.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct CommandParams {
    params: BTreeMap<String, String>,
}

impl CommandParams {
    pub fn new() -> CommandParams {
        CommandParams::default()
    }

    pub fn from_pairs<'a, I>(pairs: I) -> CommandParams
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        CommandParams {
            params: pairs
                .into_iter()
                .map(|(k, v)| (k.to_lowercase(), v.into()))
                .collect(),
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.params.contains_key(&name.to_lowercase())
    }

    pub fn get_string(&self, name: &str) -> Option<&str> {
        self.params.get(&name.to_lowercase()).map(|v| v.as_str())
    }

    pub fn get_number<T: FromStr + Copy>(&self, name: &str) -> Option<T> {
        self.params
            .get(&name.to_lowercase())
            .and_then(|v| v.parse().ok())
    }

    /// Typed float lookup with the usual range checks. Returns `default`
    /// when the parameter is absent.
    pub fn get_float(
        &self,
        name: &'static str,
        default: f64,
        above: Option<f64>,
        minval: Option<f64>,
        maxval: Option<f64>,
    ) -> Result<f64, CommandError> {
        let v = match self.params.get(&name.to_lowercase()) {
            None => return Ok(default),
            Some(raw) => raw
                .parse::<f64>()
                .map_err(|_| CommandError::InvalidParameter {
                    name,
                    value: raw.clone(),
                })?,
        };
        if let Some(above) = above {
            if v <= above {
                return Err(CommandError::ParameterOutOfRange { name, value: v });
            }
        }
        if let Some(minval) = minval {
            if v < minval {
                return Err(CommandError::ParameterOutOfRange { name, value: v });
            }
        }
        if let Some(maxval) = maxval {
            if v > maxval {
                return Err(CommandError::ParameterOutOfRange { name, value: v });
            }
        }
        Ok(v)
    }

    pub fn get_int(
        &self,
        name: &'static str,
        default: i64,
        minval: Option<i64>,
        maxval: Option<i64>,
    ) -> Result<i64, CommandError> {
        let v = match self.params.get(&name.to_lowercase()) {
            None => return Ok(default),
            Some(raw) => raw
                .parse::<i64>()
                .map_err(|_| CommandError::InvalidParameter {
                    name,
                    value: raw.clone(),
                })?,
        };
        if minval.map_or(false, |m| v < m) || maxval.map_or(false, |m| v > m) {
            return Err(CommandError::ParameterOutOfRange {
                name,
                value: v as f64,
            });
        }
        Ok(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_is_case_insensitive() {
        let params = CommandParams::from_pairs(vec![("VELOCITY", "250"), ("accel", "3000")]);
        assert_eq!(params.get_number::<f64>("velocity"), Some(250.0));
        assert_eq!(params.get_number::<f64>("ACCEL"), Some(3000.0));
        assert!(!params.contains("jerk"));
    }

    #[test]
    fn range_checks() {
        let params = CommandParams::from_pairs(vec![("accel", "0")]);
        assert!(matches!(
            params.get_float("accel", 1.0, Some(0.0), None, None),
            Err(CommandError::ParameterOutOfRange { .. })
        ));
        assert_eq!(
            params.get_float("missing", 42.0, Some(0.0), None, None),
            Ok(42.0)
        );
    }
}
