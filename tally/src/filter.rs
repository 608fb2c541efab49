//! Filter stage: validate an event against a namespace and extract a sample.
//!
//! The sample schema comes entirely from the namespace's
//! [`FilterProgram`]: adding a code class or a latency source adds fields
//! without touching classification or reduction.

use crate::error::FilterError;
use crate::event::Event;
use crate::namespace::NamespaceConfig;
use crate::program::FilterProgram;
use crate::window::MetricSample;

/// Validates `event` against `namespace` and derives its metric sample.
///
/// Every accepted event contributes:
/// - `total_metric` = 1
/// - each declared class metric = 1 if the class matches the code, else 0
/// - `success_metric` = 1 unless a matching class is a failure class
/// - latency `_sum`/`_count`/`_max` when the latency field is present,
///   plus one cumulative `_le_<bound>` field per histogram bound
///
/// # Errors
///
/// Returns [`FilterError::Rejected`] when the predicate fails, and
/// [`FilterError::InvalidLatency`] when a required latency field is
/// missing or not numeric.
///
/// # Examples
///
/// ```rust
/// use std::time::Duration;
/// use tally::event::Event;
/// use tally::filter::filter;
/// use tally::namespace::NamespaceConfig;
/// use tally::program::{CodeClass, CodeMatch, FilterProgram, Predicate};
///
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let program = FilterProgram::new(
///     Predicate::eq("domain", "G1"),
///     vec![CodeClass::new("tech_error", CodeMatch::Equals("ERR1".into()), true)],
/// );
/// let ns = NamespaceConfig::new("NS1", "G1", Duration::from_secs(60), 10, program)?;
///
/// let sample = filter(&Event::new("G1", "ERR1", 0), &ns)?;
/// assert_eq!(sample.get("total"), Some(1.0));
/// assert_eq!(sample.get("success"), Some(0.0));
/// assert_eq!(sample.get("tech_error"), Some(1.0));
///
/// assert!(filter(&Event::new("G2", "OK", 0), &ns).is_err());
/// # Ok(())
/// # }
/// ```
pub fn filter(event: &Event, namespace: &NamespaceConfig) -> Result<MetricSample, FilterError> {
    apply(&namespace.filter, &namespace.name, event)
}

/// Runs a filter program on behalf of the named namespace.
///
/// # Errors
///
/// See [`filter`].
pub fn apply(program: &FilterProgram, namespace: &str, event: &Event) -> Result<MetricSample, FilterError> {
    if !program.predicate.matches(event) {
        return Err(FilterError::Rejected {
            namespace: namespace.to_string(),
            domain: event.domain.clone(),
            code: event.code.clone(),
        });
    }

    let mut sample = MetricSample::new();
    sample.set(program.total_metric.as_str(), 1.0);

    let mut failed = false;
    for class in &program.classes {
        let hit = class.matcher.matches(&event.code);
        failed |= hit && class.failure;
        sample.set(class.metric.as_str(), if hit { 1.0 } else { 0.0 });
    }
    sample.set(program.success_metric.as_str(), if failed { 0.0 } else { 1.0 });

    if let Some(latency) = &program.latency {
        match event.field_f64(&latency.field).filter(|v| v.is_finite()) {
            Some(raw) => {
                let value = raw * latency.scale;
                sample.set(latency.sum_field(), value);
                sample.set(latency.count_field(), 1.0);
                sample.set(latency.max_field(), value);
                for (bound, field) in latency.bucket_fields() {
                    sample.set(field, if value <= bound { 1.0 } else { 0.0 });
                }
            }
            None if latency.required => {
                return Err(FilterError::InvalidLatency {
                    namespace: namespace.to_string(),
                    field: latency.field.clone(),
                });
            }
            None => {}
        }
    }

    Ok(sample)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::program::{CodeClass, CodeMatch, LatencySource, Predicate};
    use std::time::Duration;

    fn namespace() -> NamespaceConfig {
        let program = FilterProgram::new(
            Predicate::all([
                Predicate::eq("domain", "G1"),
                Predicate::any([Predicate::contains("code", "STATUS"), Predicate::eq("code", "OK")]),
            ]),
            vec![
                CodeClass::new("tech_error", CodeMatch::Equals("STATUS1".to_string()), true),
                CodeClass::new("func_error", CodeMatch::Equals("STATUS2".to_string()), false),
            ],
        );
        NamespaceConfig::new("NS1", "G1", Duration::from_secs(60), 10, program).unwrap()
    }

    #[test]
    fn test_success_code_counts_only_total_and_success() {
        for code in ["OK", "STATUS0", "STATUS9"] {
            let sample = filter(&Event::new("G1", code, 0), &namespace()).unwrap();
            assert_eq!(sample.get("total"), Some(1.0));
            assert_eq!(sample.get("success"), Some(1.0));
            assert_eq!(sample.get("tech_error"), Some(0.0));
            assert_eq!(sample.get("func_error"), Some(0.0));
        }
    }

    #[test]
    fn test_error_classes() {
        let tech = filter(&Event::new("G1", "STATUS1", 0), &namespace()).unwrap();
        assert_eq!(tech.get("success"), Some(0.0));
        assert_eq!(tech.get("tech_error"), Some(1.0));

        // Functional errors are classified but still count as served.
        let func = filter(&Event::new("G1", "STATUS2", 0), &namespace()).unwrap();
        assert_eq!(func.get("success"), Some(1.0));
        assert_eq!(func.get("func_error"), Some(1.0));
        assert_eq!(func.get("tech_error"), Some(0.0));
    }

    #[test]
    fn test_rejection_names_namespace() {
        let err = filter(&Event::new("G2", "OK", 0), &namespace()).unwrap_err();
        assert_eq!(err.namespace(), "NS1");

        let err = filter(&Event::new("G1", "BOGUS", 0), &namespace()).unwrap_err();
        assert!(matches!(err, FilterError::Rejected { ref code, .. } if code == "BOGUS"));
    }

    #[test]
    fn test_latency_source() {
        let mut ns = namespace();
        ns.filter.latency = Some(LatencySource {
            scale: 0.001,
            ..LatencySource::default()
        });

        let sample = filter(&Event::new("G1", "OK", 0).with_duration(1500.0), &ns).unwrap();
        assert_eq!(sample.get("duration_sum"), Some(1.5));
        assert_eq!(sample.get("duration_count"), Some(1.0));
        assert_eq!(sample.get("duration_max"), Some(1.5));

        // Missing optional latency leaves the fields absent.
        let sample = filter(&Event::new("G1", "OK", 0), &ns).unwrap();
        assert_eq!(sample.get("duration_count"), None);

        ns.filter.latency = Some(LatencySource {
            required: true,
            ..LatencySource::default()
        });
        let err = filter(&Event::new("G1", "OK", 0), &ns).unwrap_err();
        assert!(matches!(err, FilterError::InvalidLatency { .. }));
    }

    #[test]
    fn test_histogram_buckets_are_cumulative() {
        let mut ns = namespace();
        ns.filter.latency = Some(LatencySource::default().with_buckets([0.1, 0.5, 1.0]));

        let sample = filter(&Event::new("G1", "OK", 0).with_duration(0.5), &ns).unwrap();
        assert_eq!(sample.get("duration_le_0.1"), Some(0.0));
        assert_eq!(sample.get("duration_le_0.5"), Some(1.0));
        assert_eq!(sample.get("duration_le_1"), Some(1.0));
        assert_eq!(sample.get("duration_count"), Some(1.0));
    }
}
