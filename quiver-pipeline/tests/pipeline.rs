use std::sync::Arc;
use std::thread;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use quiver_config::{ErrorPolicy, ExecutionMode, ExecutionSettings};
use quiver_core::{is_chronological, DataPoint, Series};
use quiver_indicators::{
    resolve_indicator, BatchIndicator, IndicatorCapability, IndicatorError, IndicatorResult,
    IndicatorState, Params, StateTransition, StreamingIndicator,
};
use quiver_pipeline::{
    compose_execute, compose_streams, deserialize_composition, execute, init_streaming,
    serialize_composition, stream_execute, BatchExecutor, CompositionConfig, PipelineBuilder,
    PipelineConfig, PipelineError, StageFailure, StageOptions, ValidationError,
};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

/// Streaming indicator that rejects every input.
struct AlwaysFails;

impl BatchIndicator for AlwaysFails {
    fn name(&self) -> &str {
        "always_fails"
    }

    fn validate(&self, _params: &Params) -> IndicatorResult<()> {
        Ok(())
    }

    fn min_length(&self, _params: &Params) -> usize {
        0
    }

    fn compute(&self, _series: &[DataPoint], _params: &Params) -> IndicatorResult<Series> {
        Err(IndicatorError::Computation("always fails".into()))
    }
}

impl StreamingIndicator for AlwaysFails {
    fn init(&self, _params: &Params) -> IndicatorResult<IndicatorState> {
        Ok(IndicatorState::from_parts("always_fails", Vec::new()))
    }

    fn update(
        &self,
        _state: &IndicatorState,
        _point: &DataPoint,
        _params: &Params,
    ) -> IndicatorResult<StateTransition> {
        Err(IndicatorError::Computation("always fails".into()))
    }
}

/// Batch indicator that takes longer than any reasonable stage timeout.
struct Sleepy;

impl BatchIndicator for Sleepy {
    fn name(&self) -> &str {
        "sleepy"
    }

    fn validate(&self, _params: &Params) -> IndicatorResult<()> {
        Ok(())
    }

    fn min_length(&self, _params: &Params) -> usize {
        0
    }

    fn compute(&self, _series: &[DataPoint], _params: &Params) -> IndicatorResult<Series> {
        thread::sleep(Duration::from_secs(5));
        Ok(Vec::new())
    }
}

fn period(value: i64) -> Params {
    let mut params = Params::new();
    params.insert("period".into(), toml::Value::Integer(value));
    params
}

fn period_on(value: i64, source: &str) -> Params {
    let mut params = period(value);
    params.insert("source".into(), toml::Value::String(source.into()));
    params
}

fn indicator(name: &str) -> IndicatorCapability {
    resolve_indicator(name).unwrap()
}

fn closes(values: &[Decimal]) -> Series {
    values
        .iter()
        .enumerate()
        .map(|(idx, close)| {
            DataPoint::candle(
                Utc.timestamp_opt(idx as i64 * 60, 0).unwrap(),
                *close - dec!(0.5),
                *close + dec!(1),
                *close - dec!(1),
                *close,
                Decimal::from(idx as i64 + 1),
            )
        })
        .collect()
}

fn market(len: usize) -> Series {
    let values: Vec<Decimal> = (0..len)
        .map(|idx| Decimal::from(100 + (idx as i64 * 7) % 13) + dec!(0.25))
        .collect();
    closes(&values)
}

fn trend_pipeline(settings: ExecutionSettings) -> PipelineConfig {
    PipelineBuilder::new()
        .add_stage("sma", indicator("sma"), period(3), StageOptions::new())
        .unwrap()
        .add_stage("ema", indicator("ema"), period(4), StageOptions::new())
        .unwrap()
        .add_stage("rsi", indicator("rsi"), period(5), StageOptions::new())
        .unwrap()
        .add_stage("bands", indicator("bollinger"), period(4), StageOptions::new())
        .unwrap()
        .add_stage("roc", indicator("roc"), period(2), StageOptions::new())
        .unwrap()
        .add_stage(
            "smoothed",
            indicator("ema"),
            period_on(2, "value"),
            StageOptions::new().input_from("sma"),
        )
        .unwrap()
        .configure(&settings)
        .build()
        .unwrap()
}

#[test]
fn sma_over_three_closes() {
    let config = PipelineBuilder::new()
        .add_stage("sma", indicator("sma"), period(2), StageOptions::new())
        .unwrap()
        .build()
        .unwrap();
    let data = closes(&[dec!(10), dec!(20), dec!(30)]);

    let result = execute(&config, &data).unwrap();
    let sma = result.stage("sma").unwrap();
    assert_eq!(sma.len(), 2);
    assert_eq!(sma[0].timestamp, data[1].timestamp);
    assert_eq!(sma[0].get("value"), Some(dec!(15)));
    assert_eq!(sma[1].timestamp, data[2].timestamp);
    assert_eq!(sma[1].get("value"), Some(dec!(25)));
}

#[test]
fn dependency_on_undeclared_dependent_names_it() {
    let err = PipelineBuilder::new()
        .add_stage("a", indicator("sma"), period(2), StageOptions::new())
        .unwrap()
        .add_dependency("b", "a")
        .build()
        .unwrap_err();
    assert_eq!(err, ValidationError::UnknownStage("b".into()));
    assert!(err.to_string().contains("`b`"));
}

#[test]
fn independent_stages_produce_one_series_each() {
    let config = trend_pipeline(ExecutionSettings::default());
    let result = execute(&config, &market(40)).unwrap();

    assert_eq!(result.results.len(), config.stages().len());
    assert!(result.is_success());
    let merged: Series = result.merged.iter().map(|entry| entry.point.clone()).collect();
    assert!(is_chronological(&merged));
    let total: usize = result.results.values().map(Vec::len).sum();
    assert_eq!(merged.len(), total);
    assert_eq!(result.metrics.points, 40);
    assert_eq!(result.metrics.stages.len(), config.stages().len());
}

#[test]
fn merged_ties_follow_declaration_order() {
    let config = PipelineBuilder::new()
        .add_stage("second", indicator("sma"), period(1), StageOptions::new())
        .unwrap()
        .add_stage("first", indicator("ema"), period(1), StageOptions::new())
        .unwrap()
        .build()
        .unwrap();
    let result = execute(&config, &closes(&[dec!(1), dec!(2)])).unwrap();
    let ids: Vec<&str> = result.merged.iter().map(|entry| entry.stage_id.as_str()).collect();
    assert_eq!(ids, vec!["second", "first", "second", "first"]);
}

#[test]
fn batch_runs_are_deterministic() {
    let config = trend_pipeline(ExecutionSettings::default());
    let data = market(30);
    let first = execute(&config, &data).unwrap();
    let second = execute(&config, &data).unwrap();
    assert_eq!(first.results, second.results);
    assert_eq!(first.merged, second.merged);
}

#[test]
fn parallel_mode_matches_sequential_mode() {
    let sequential = trend_pipeline(ExecutionSettings::default());
    let parallel = trend_pipeline(
        ExecutionSettings::default()
            .with_mode(ExecutionMode::Parallel)
            .with_max_workers(3),
    );
    let data = market(50);
    let expected = execute(&sequential, &data).unwrap();
    let actual = execute(&parallel, &data).unwrap();
    assert_eq!(expected.results, actual.results);
    assert_eq!(expected.merged, actual.merged);
}

#[test]
fn fail_fast_batch_reports_stage_and_input() {
    let config = PipelineBuilder::new()
        .add_stage("sma", indicator("sma"), period(2), StageOptions::new())
        .unwrap()
        .add_stage(
            "broken",
            IndicatorCapability::streaming(AlwaysFails),
            Params::new(),
            StageOptions::new(),
        )
        .unwrap()
        .build()
        .unwrap();
    let err = execute(&config, &market(5)).unwrap_err();
    match err {
        PipelineError::Execution(err) => {
            assert_eq!(err.stage_id, "broken");
            assert!(err.to_string().contains("batch of 5 points"), "{err}");
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn continue_on_error_batch_skips_dependents() {
    let config = PipelineBuilder::new()
        .add_stage(
            "broken",
            IndicatorCapability::streaming(AlwaysFails),
            Params::new(),
            StageOptions::new(),
        )
        .unwrap()
        .add_stage(
            "downstream",
            indicator("sma"),
            period_on(2, "value"),
            StageOptions::new().input_from("broken"),
        )
        .unwrap()
        .add_stage("healthy", indicator("sma"), period(2), StageOptions::new())
        .unwrap()
        .configure(&ExecutionSettings::default().with_error_policy(ErrorPolicy::ContinueOnError))
        .build()
        .unwrap();

    let result = execute(&config, &market(5)).unwrap();
    assert_eq!(result.results.keys().collect::<Vec<_>>(), vec!["healthy"]);
    assert_eq!(result.errors.len(), 2);
    assert_eq!(result.errors[0].stage_id, "broken");
    assert_eq!(
        result.errors[1].failure,
        StageFailure::UpstreamFailed("broken".into())
    );
    assert_eq!(result.metrics.failed_stages(), 2);
}

#[test]
fn executor_accumulates_metrics_across_runs() {
    let config = PipelineBuilder::new()
        .add_stage("sma", indicator("sma"), period(2), StageOptions::new())
        .unwrap()
        .add_stage(
            "fast",
            indicator("ema"),
            period_on(2, "high"),
            StageOptions::new(),
        )
        .unwrap()
        .build()
        .unwrap();
    let executor = BatchExecutor::new(&config).unwrap();
    executor.execute(&market(10)).unwrap();
    executor.execute(&market(6)).unwrap();

    let totals = executor.metrics();
    assert_eq!(totals.total_executions(), 2);
    assert_eq!(totals.points_processed(), 16);
    assert_eq!(totals.total_errors(), 0);
    let sma = totals.stage("sma").unwrap();
    assert_eq!(sma.executions(), 2);
    assert_eq!(sma.results(), 9 + 5);
    assert_eq!(totals.stage("fast").unwrap().executions(), 2);
}

#[test]
fn fail_fast_runs_still_count_toward_metrics() {
    let config = PipelineBuilder::new()
        .add_stage("sma", indicator("sma"), period(2), StageOptions::new())
        .unwrap()
        .add_stage(
            "broken",
            IndicatorCapability::streaming(AlwaysFails),
            Params::new(),
            StageOptions::new(),
        )
        .unwrap()
        .build()
        .unwrap();
    let executor = BatchExecutor::new(&config).unwrap();
    assert!(executor.execute(&market(5)).is_err());
    assert!(executor.execute(&market(5)).is_err());

    let totals = executor.metrics();
    assert_eq!(totals.total_executions(), 2);
    assert_eq!(totals.points_processed(), 10);
    assert_eq!(totals.stage("broken").unwrap().errors(), 2);
    assert_eq!(totals.stage("sma").unwrap().results(), 8);
    assert_eq!(totals.total_errors(), 2);
}

#[test]
fn short_inputs_are_insufficient_data() {
    let config = PipelineBuilder::new()
        .add_stage("rsi", indicator("rsi"), period(14), StageOptions::new())
        .unwrap()
        .build()
        .unwrap();
    let err = match execute(&config, &market(3)) {
        Err(PipelineError::Execution(err)) => err,
        other => panic!("expected an execution error, got {other:?}"),
    };
    assert_eq!(
        err.failure,
        StageFailure::InsufficientData {
            required: 15,
            available: 3
        }
    );
}

#[test]
fn slow_stages_time_out() {
    let config = PipelineBuilder::new()
        .add_stage(
            "slow",
            IndicatorCapability::stateless(Sleepy),
            Params::new(),
            StageOptions::new(),
        )
        .unwrap()
        .add_stage("sma", indicator("sma"), period(2), StageOptions::new())
        .unwrap()
        .configure(
            &ExecutionSettings::default()
                .with_stage_timeout(Duration::from_millis(250))
                .with_error_policy(ErrorPolicy::ContinueOnError),
        )
        .build()
        .unwrap();
    let result = execute(&config, &market(4)).unwrap();
    assert_eq!(result.errors.len(), 1);
    assert_eq!(
        result.errors[0].failure,
        StageFailure::Timeout(Duration::from_millis(250))
    );
    assert!(result.stage("sma").is_some());
}

#[test]
fn streaming_matches_direct_updates() {
    let config = Arc::new(trend_pipeline(ExecutionSettings::default()));
    let data = market(30);

    let mut state = init_streaming(Arc::clone(&config)).unwrap();
    let mut streamed: Vec<Series> = vec![Vec::new(); 3];
    for point in &data {
        let update = stream_execute(&state, point).unwrap();
        for (slot, id) in ["sma", "rsi", "bands"].iter().enumerate() {
            if let Some(output) = update.output.results.get(*id) {
                streamed[slot].push(output.clone());
            }
        }
        state = update.state;
    }

    for (slot, (name, params)) in [("sma", period(3)), ("rsi", period(5)), ("bollinger", period(4))]
        .into_iter()
        .enumerate()
    {
        let direct = resolve_indicator(name).unwrap();
        let direct = direct.as_streaming().unwrap();
        let mut direct_state = direct.init(&params).unwrap();
        let mut expected = Vec::new();
        for point in &data {
            let transition = direct.update(&direct_state, point, &params).unwrap();
            direct_state = transition.state;
            expected.extend(transition.output);
        }
        assert_eq!(streamed[slot], expected, "{name}");
    }
    assert_eq!(state.metrics().total_executions(), 30);
    assert!(state.stage_state("roc").is_none());
}

#[test]
fn stage_inputs_agree_between_batch_and_streaming() {
    let config = Arc::new(trend_pipeline(ExecutionSettings::default()));
    let data = market(25);
    let batch = execute(&config, &data).unwrap();

    let mut state = init_streaming(Arc::clone(&config)).unwrap();
    let mut smoothed = Vec::new();
    for point in &data {
        let update = state.advance(point).unwrap();
        smoothed.extend(update.output.results.get("smoothed").cloned());
        state = update.state;
    }
    assert!(!smoothed.is_empty());
    assert_eq!(batch.stage("smoothed").unwrap(), &smoothed);
}

#[test]
fn continue_on_error_streaming_omits_failing_stage() {
    let config = Arc::new(
        PipelineBuilder::new()
            .add_stage(
                "x",
                IndicatorCapability::streaming(AlwaysFails),
                Params::new(),
                StageOptions::new(),
            )
            .unwrap()
            .add_stage("y", indicator("sma"), period(2), StageOptions::new())
            .unwrap()
            .configure(
                &ExecutionSettings::default().with_error_policy(ErrorPolicy::ContinueOnError),
            )
            .build()
            .unwrap(),
    );
    let mut state = init_streaming(Arc::clone(&config)).unwrap();
    let initial_x = state.stage_state("x").cloned();
    for (idx, point) in market(6).iter().enumerate() {
        let update = stream_execute(&state, point).unwrap();
        assert!(!update.output.results.contains_key("x"));
        assert_eq!(update.output.results.contains_key("y"), idx >= 1);
        assert_eq!(update.output.errors.len(), 1);
        assert_eq!(update.output.errors[0].stage_id, "x");
        state = update.state;
    }
    assert_eq!(state.stage_state("x").cloned(), initial_x);
    assert_eq!(state.metrics().stage("x").unwrap().errors(), 6);
    assert_eq!(state.metrics().stage("y").unwrap().results(), 5);
}

#[test]
fn composition_survives_a_round_trip() {
    let prices = Arc::new(trend_pipeline(ExecutionSettings::default()));
    let volume = Arc::new(
        PipelineBuilder::new()
            .add_stage("volume_sma", indicator("sma"), period_on(3, "volume"), StageOptions::new())
            .unwrap()
            .build()
            .unwrap(),
    );
    let config = CompositionConfig::new("prices", prices).with_dependent("volume", volume);

    let mut state = compose_streams(&config).unwrap();
    for point in &market(10) {
        state = compose_execute(&state, point).unwrap().state;
    }
    let blob = serialize_composition(&state).unwrap();
    let restored = deserialize_composition(&config, &blob).unwrap();
    assert_eq!(restored, state);

    let next = DataPoint::new(Utc.timestamp_opt(10 * 60, 0).unwrap())
        .with_field("close", dec!(101))
        .with_field("volume", dec!(11));
    let from_live = compose_execute(&state, &next).unwrap();
    let from_restored = compose_execute(&restored, &next).unwrap();
    assert_eq!(from_live.results["prices"].results, from_restored.results["prices"].results);
    assert_eq!(
        from_restored.results["volume"].results["volume_sma"].get("value"),
        Some(dec!(10))
    );
}
