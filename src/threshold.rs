//! Pass/fail criteria evaluated against the final metrics.
//!
//! Options declare thresholds per metric (optionally narrowed by tags), each a list
//! of `<stat> <op> <value>` expressions:
//!
//! ```yaml
//! thresholds:
//!   http_req_duration: ["p(95) < 500", "avg < 200"]
//!   "http_req_failed{scenario:place_order}": ["rate < 0.01"]
//! ```

use std::{collections::BTreeMap, fmt, str::FromStr};

use serde::Serialize;

use crate::{
    aggregate::Stat,
    aggregator::{MetricSelector, Snapshot},
    error::ConfigError,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
}

impl Op {
    /// Longest tokens first so `<=` is never read as `<`.
    const TOKENS: [(&'static str, Op); 6] = [
        ("<=", Op::Le),
        (">=", Op::Ge),
        ("==", Op::Eq),
        ("!=", Op::Ne),
        ("<", Op::Lt),
        (">", Op::Gt),
    ];

    pub fn apply(self, lhs: f64, rhs: f64) -> bool {
        match self {
            Op::Lt => lhs < rhs,
            Op::Le => lhs <= rhs,
            Op::Gt => lhs > rhs,
            Op::Ge => lhs >= rhs,
            Op::Eq => lhs == rhs,
            Op::Ne => lhs != rhs,
        }
    }
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let token = Op::TOKENS
            .iter()
            .find(|(_, op)| op == self)
            .map(|(t, _)| *t)
            .unwrap_or("?");
        f.write_str(token)
    }
}

/// One parsed threshold expression bound to a metric selector.
#[derive(Debug, Clone, PartialEq)]
pub struct Threshold {
    pub selector: MetricSelector,
    pub stat: Stat,
    pub op: Op,
    pub value: f64,
    expression: String,
}

impl Threshold {
    pub fn parse(metric: &str, expression: &str) -> Result<Self, ConfigError> {
        let invalid = |reason: &str| ConfigError::InvalidThreshold {
            metric: metric.to_string(),
            expression: expression.to_string(),
            reason: reason.to_string(),
        };
        let selector = MetricSelector::from_str(metric)?;

        let (pos, token, op) = Op::TOKENS
            .iter()
            .filter_map(|(token, op)| expression.find(token).map(|pos| (pos, *token, *op)))
            .min_by_key(|(pos, token, _)| (*pos, usize::MAX - token.len()))
            .ok_or_else(|| invalid("missing comparison operator"))?;

        let stat = expression[..pos]
            .trim()
            .parse::<Stat>()
            .map_err(|e| invalid(&e.to_string()))?;
        let value = expression[pos + token.len()..]
            .trim()
            .parse::<f64>()
            .map_err(|_| invalid("right-hand side is not a number"))?;

        Ok(Self {
            selector,
            stat,
            op,
            value,
            expression: expression.trim().to_string(),
        })
    }

    /// Parse the `thresholds` option map.
    pub fn parse_all(raw: &BTreeMap<String, Vec<String>>) -> Result<Vec<Self>, ConfigError> {
        raw.iter()
            .flat_map(|(metric, exprs)| exprs.iter().map(move |e| Self::parse(metric, e)))
            .collect()
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// A threshold on a metric that was never recorded, or on a stat the metric
    /// kind does not have, fails.
    pub fn evaluate(&self, snapshot: &Snapshot) -> ThresholdResult {
        let actual = snapshot.stat(&self.selector, &self.stat);
        let passed = actual.is_some_and(|v| self.op.apply(v, self.value));
        if !passed {
            tracing::warn!(
                metric = %self.selector,
                expression = %self.expression,
                ?actual,
                "Threshold crossed"
            );
        }
        ThresholdResult {
            metric: self.selector.to_string(),
            expression: self.expression.clone(),
            actual,
            passed,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ThresholdResult {
    pub metric: String,
    pub expression: String,
    pub actual: Option<f64>,
    pub passed: bool,
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::{
        aggregator::{MetricsAggregator, Recorder},
        metric::names,
    };

    #[test]
    fn parses_operators() {
        let t = Threshold::parse("http_req_duration", "p(95)<=500").unwrap();
        assert_eq!(t.stat, Stat::Percentile(95.0));
        assert_eq!(t.op, Op::Le);
        assert_eq!(t.value, 500.0);

        let t = Threshold::parse("http_req_failed{scenario:a}", " rate < 0.01 ").unwrap();
        assert_eq!(t.op, Op::Lt);
        assert_eq!(t.selector.tags.get("scenario").map(String::as_str), Some("a"));
        assert_eq!(t.expression(), "rate < 0.01");

        assert_eq!(Threshold::parse("x", "count != 0").unwrap().op, Op::Ne);
        assert_eq!(Threshold::parse("x", "count >= 3").unwrap().op, Op::Ge);
    }

    #[test]
    fn rejects_malformed_expressions() {
        for bad in ["p(95) 500", "p(101) < 5", "avg < fast", "< 5", "mean < 5"] {
            assert!(
                matches!(
                    Threshold::parse("http_req_duration", bad),
                    Err(ConfigError::InvalidThreshold { .. })
                ),
                "{bad}"
            );
        }
    }

    #[test]
    fn evaluates_against_snapshot() {
        let agg = Arc::new(MetricsAggregator::with_shards(1));
        let rec = Recorder::new(Arc::clone(&agg));
        for v in [10.0, 20.0, 30.0] {
            rec.trend(names::HTTP_REQ_DURATION, v);
        }
        rec.rate(names::HTTP_REQ_FAILED, false);
        let snap = agg.finalize().unwrap();

        let ok = Threshold::parse("http_req_duration", "max < 50").unwrap();
        assert!(ok.evaluate(&snap).passed);
        let failing = Threshold::parse("http_req_duration", "avg < 15").unwrap();
        let res = failing.evaluate(&snap);
        assert!(!res.passed);
        assert_eq!(res.actual, Some(20.0));

        let missing = Threshold::parse("grpc_req_duration", "avg < 15").unwrap();
        assert_eq!(missing.evaluate(&snap).actual, None);
        assert!(!missing.evaluate(&snap).passed);
    }
}
