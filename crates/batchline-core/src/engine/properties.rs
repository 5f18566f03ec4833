//! Property substitution for artifact and step properties.
//!
//! Supports `#{jobParameters['name']}`, `#{jobProperties['name']}` and
//! `#{partitionPlan['name']}`, each optionally followed by `?:default;`.
//! Unresolvable references without a default become the empty string.

use batchline_types::definition::Properties;
use batchline_types::job::JobParameters;

const OPEN: &str = "#{";

#[derive(Debug, Clone, Default)]
pub struct PropertyResolver {
    job_parameters: JobParameters,
    job_properties: Properties,
    partition_plan: Properties,
}

impl PropertyResolver {
    pub fn new(job_parameters: JobParameters, job_properties: Properties) -> Self {
        Self {
            job_parameters,
            job_properties,
            partition_plan: Properties::new(),
        }
    }

    /// A resolver that also sees one partition's plan properties.
    pub fn for_partition(&self, partition_plan: Properties) -> Self {
        Self {
            partition_plan,
            ..self.clone()
        }
    }

    pub fn resolve_all(&self, properties: &Properties) -> Properties {
        properties
            .iter()
            .map(|(k, v)| (k.clone(), self.resolve(v)))
            .collect()
    }

    pub fn resolve(&self, value: &str) -> String {
        let mut out = String::with_capacity(value.len());
        let mut rest = value;

        while let Some(start) = rest.find(OPEN) {
            out.push_str(&rest[..start]);
            let after = &rest[start..];
            match self.expand(after) {
                Some((replacement, consumed)) => {
                    out.push_str(&replacement);
                    rest = &after[consumed..];
                }
                None => {
                    // Not a reference; keep the marker literally.
                    out.push_str(OPEN);
                    rest = &after[OPEN.len()..];
                }
            }
        }
        out.push_str(rest);
        out
    }

    /// Expand one `#{source['name']}` (plus optional `?:default;`) at the
    /// start of `text`. Returns the replacement and bytes consumed.
    fn expand(&self, text: &str) -> Option<(String, usize)> {
        let end = text.find('}')?;
        let expr = &text[OPEN.len()..end];
        let (source, rest) = expr.split_once("['")?;
        let name = rest.strip_suffix("']")?;

        let found = match source {
            "jobParameters" => self.job_parameters.get(name),
            "jobProperties" => self.job_properties.get(name),
            "partitionPlan" => self.partition_plan.get(name),
            _ => return None,
        }
        .cloned();

        let mut consumed = end + 1;
        let mut default = None;
        if let Some(tail) = text[consumed..].strip_prefix("?:") {
            if let Some(semi) = tail.find(';') {
                default = Some(tail[..semi].to_string());
                consumed += 2 + semi + 1;
            }
        }

        Some((found.or(default).unwrap_or_default(), consumed))
    }
}
