//! Building pipelines from declarative definitions.

use quiver_config::PipelineDefinition;
use quiver_indicators::{indicator_registry, IndicatorRegistry};
use tracing::debug;

use crate::builder::{PipelineBuilder, PipelineConfig, StageOptions};
use crate::error::{PipelineResult, ValidationError};

impl PipelineBuilder {
    /// Declares every stage of `definition`, resolving indicators through
    /// `registry`. Execution settings are merged but nothing is validated
    /// beyond stage ids and indicator names until [`build`](Self::build).
    pub fn from_definition(
        definition: &PipelineDefinition,
        registry: &IndicatorRegistry,
    ) -> Result<Self, ValidationError> {
        let mut builder = Self::new().configure(&definition.execution);
        for stage in &definition.stages {
            let indicator = registry.get(&stage.indicator).ok_or_else(|| {
                ValidationError::UnknownIndicator {
                    stage: stage.id.clone(),
                    indicator: stage.indicator.clone(),
                }
            })?;
            let mut opts = StageOptions::new();
            for dependency in &stage.depends_on {
                opts = opts.depends_on(dependency.clone());
            }
            if let Some(input) = &stage.input {
                opts = opts.input_from(input.clone());
            }
            debug!(
                pipeline = definition.display_name(),
                stage = %stage.id,
                indicator = indicator.name(),
                "declaring stage"
            );
            builder = builder.add_stage(stage.id.clone(), indicator, stage.params.clone(), opts)?;
        }
        Ok(builder)
    }
}

/// Builds a pipeline from a definition using the global indicator registry.
pub fn build_pipeline(definition: &PipelineDefinition) -> PipelineResult<PipelineConfig> {
    let config = PipelineBuilder::from_definition(definition, indicator_registry())?.build()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use quiver_config::{parse_pipeline, ErrorPolicy, ExecutionMode};

    #[test]
    fn builds_stages_and_settings_from_toml() {
        let definition = parse_pipeline(
            r#"
[execution]
mode = "parallel"
error_policy = "continue_on_error"

[[stages]]
id = "slow"
indicator = "ema"
params = { period = 2, source = "value" }
input = "fast"

[[stages]]
id = "fast"
indicator = "Simple_Moving_Average"
params = { period = 3 }
"#,
        )
        .unwrap();
        let config = build_pipeline(&definition).unwrap();
        assert_eq!(config.execution_order(), vec!["fast", "slow"]);
        assert_eq!(config.policy().mode, ExecutionMode::Parallel);
        assert_eq!(config.policy().error_policy, ErrorPolicy::ContinueOnError);
        assert_eq!(config.stage("fast").unwrap().indicator().name(), "sma");
    }

    #[test]
    fn unknown_indicators_name_the_stage() {
        let definition =
            parse_pipeline("[[stages]]\nid = \"cloud\"\nindicator = \"ichimoku\"\n").unwrap();
        let err = build_pipeline(&definition).unwrap_err();
        assert!(matches!(
            err,
            crate::PipelineError::Validation(ValidationError::UnknownIndicator { ref stage, .. })
                if stage == "cloud"
        ));
    }
}
