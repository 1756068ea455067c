//! Ingest-time preprocessing of samples.

use crate::config::ConversionRule;
use crate::error::AppResult;
use crate::sample::{Address, Sample, Value};

/// Linear unit conversion `value * scale + offset` for one address.
#[derive(Debug, Clone, PartialEq)]
pub struct UnitConversion {
    source: Address,
    target: Address,
    scale: f64,
    offset: f64,
}

impl UnitConversion {
    /// Build a conversion; `target == None` converts in place.
    pub fn new(source: Address, target: Option<Address>, scale: f64, offset: f64) -> Self {
        Self {
            target: target.unwrap_or_else(|| source.clone()),
            source,
            scale,
            offset,
        }
    }

    /// Build a conversion from its configuration entry.
    pub fn from_rule(rule: &ConversionRule) -> AppResult<Self> {
        let source = Address::parse(&rule.topic)?;
        let target = rule.target.as_deref().map(Address::parse).transpose()?;
        Ok(Self::new(source, target, rule.scale, rule.offset))
    }

    /// Address the rule listens on.
    pub fn source(&self) -> &Address {
        &self.source
    }

    /// Whether the converted value replaces the original.
    pub fn in_place(&self) -> bool {
        self.source == self.target
    }

    fn convert(&self, value: &Value) -> Value {
        match value.as_f64() {
            Some(x) => Value::Float(x * self.scale + self.offset),
            None => value.clone(),
        }
    }

    /// Converted copy of `sample` addressed to the target.
    pub fn apply(&self, sample: &Sample) -> Sample {
        Sample::new(
            self.target.clone(),
            self.convert(&sample.value),
            sample.timestamp,
        )
    }
}

/// Run every matching rule against `sample`.
///
/// Returns the samples to store: the original (or its in-place conversion)
/// first, then one derived sample per rule writing to another address.
pub fn expand(rules: &[UnitConversion], sample: Sample) -> Vec<Sample> {
    let mut primary = sample.clone();
    let mut derived = Vec::new();
    for rule in rules.iter().filter(|r| r.source == sample.address) {
        if rule.in_place() {
            primary = rule.apply(&primary);
        } else {
            derived.push(rule.apply(&sample));
        }
    }
    let mut out = Vec::with_capacity(1 + derived.len());
    out.push(primary);
    out.extend(derived);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn sample(addr: &str, value: Value) -> Sample {
        Sample::parse(addr, value, Utc::now()).unwrap()
    }

    #[test]
    fn in_place_conversion_overwrites() {
        let rule = UnitConversion::from_rule(&ConversionRule {
            topic: "rm2/wind/speed".into(),
            target: None,
            scale: 1000.0,
            offset: 0.0,
        })
        .unwrap();
        let out = expand(&[rule], sample("rm2/wind/speed", Value::Float(1.5)));
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].value, Value::Float(1500.0));
    }

    #[test]
    fn derived_target_keeps_original() {
        let rule = UnitConversion::new(
            Address::parse("rm3/temp/c").unwrap(),
            Some(Address::parse("rm3/temp/k").unwrap()),
            1.0,
            273.0,
        );
        let out = expand(&[rule], sample("rm3/temp/c", Value::Int(10)));
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].value, Value::Int(10));
        assert_eq!(out[1].address.as_str(), "rm3/temp/k");
        assert_eq!(out[1].value, Value::Float(283.0));
    }

    #[test]
    fn non_numeric_passes_through() {
        let rule = UnitConversion::new(Address::parse("rm1/gps/fix").unwrap(), None, 2.0, 0.0);
        let out = expand(&[rule], sample("rm1/gps/fix", Value::Text("3d".into())));
        assert_eq!(out[0].value, Value::Text("3d".into()));
    }

    #[test]
    fn unrelated_samples_untouched() {
        let rule = UnitConversion::new(Address::parse("rm1/gps/lat").unwrap(), None, 2.0, 0.0);
        let out = expand(&[rule], sample("rm1/gps/long", Value::Float(1.0)));
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].value, Value::Float(1.0));
    }
}
