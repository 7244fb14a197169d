use anyhow::{anyhow, Result};
use forecaster::config::{PointModelSettings, SamplingModelSettings};
use forecaster::context::ExecutionContext;
use forecaster::foundation::{
    PointAdapter, PointForecaster, PointModelLoader, PointOutput, SampleForecaster,
    SamplingAdapter, SamplingModelLoader,
};
use forecaster::models::{Histories, HorizonTable};
use forecaster::orchestrator::InferenceOrchestrator;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Once};

const MIN_HISTORY: usize = 30;

fn ensure_test_env() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = env_logger::builder().is_test(true).try_init();
    });
}

/// Shared bookkeeping across both stub models.
#[derive(Clone, Default)]
struct Residency {
    live: Arc<AtomicUsize>,
    max: Arc<AtomicUsize>,
    events: Arc<Mutex<Vec<String>>>,
}

impl Residency {
    fn load(&self, name: &str) {
        let now = self.live.fetch_add(1, Ordering::SeqCst) + 1;
        self.max.fetch_max(now, Ordering::SeqCst);
        self.record(format!("load {}", name));
    }

    fn release(&self, name: &str) {
        self.live.fetch_sub(1, Ordering::SeqCst);
        self.record(format!("release {}", name));
    }

    fn record(&self, event: String) {
        self.events.lock().unwrap().push(event);
    }

    fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }
}

struct LinearPoint {
    residency: Residency,
}

impl PointForecaster for LinearPoint {
    fn forecast(&mut self, context: &[f64], horizon: usize) -> Result<PointOutput> {
        let last = context[context.len() - 1];
        Ok(PointOutput::Batched(vec![(1..=horizon)
            .map(|step| last + step as f64)
            .collect()]))
    }
}

impl Drop for LinearPoint {
    fn drop(&mut self) {
        self.residency.release("timesfm");
    }
}

struct PointLoader {
    residency: Residency,
    fail: bool,
}

impl PointModelLoader for PointLoader {
    fn load(&self, model: &str, _: &ExecutionContext) -> Result<Box<dyn PointForecaster>> {
        if self.fail {
            return Err(anyhow!("{} checkpoint unavailable", model));
        }
        self.residency.load(model);
        Ok(Box::new(LinearPoint {
            residency: self.residency.clone(),
        }))
    }
}

/// Every trajectory sits 2% above the last context value.
struct FlatSampler {
    residency: Residency,
    poisoned_last: Option<f64>,
}

impl SampleForecaster for FlatSampler {
    fn sample(
        &mut self,
        context: &[f64],
        prediction_length: usize,
        num_samples: usize,
    ) -> Result<Vec<Vec<f64>>> {
        let last = context[context.len() - 1];
        if self.poisoned_last == Some(last) {
            return Err(anyhow!("sampling diverged"));
        }
        Ok(vec![vec![last * 1.02; prediction_length]; num_samples])
    }
}

impl Drop for FlatSampler {
    fn drop(&mut self) {
        self.residency.release("chronos");
    }
}

struct SamplerLoader {
    residency: Residency,
    poisoned_last: Option<f64>,
}

impl SamplingModelLoader for SamplerLoader {
    fn load(&self, model: &str, context: &ExecutionContext) -> Result<Box<dyn SampleForecaster>> {
        assert_eq!(context.device_label(), "cpu");
        self.residency.load(model);
        Ok(Box::new(FlatSampler {
            residency: self.residency.clone(),
            poisoned_last: self.poisoned_last,
        }))
    }
}

fn orchestrator(
    residency: &Residency,
    fail_point_load: bool,
    poisoned_last: Option<f64>,
) -> InferenceOrchestrator {
    let horizons = HorizonTable::orchestrator_default();
    let point = PointAdapter::new(
        PointModelSettings::default(),
        horizons.clone(),
        MIN_HISTORY,
        ExecutionContext::cpu().expect("cpu"),
        Box::new(PointLoader {
            residency: residency.clone(),
            fail: fail_point_load,
        }),
    );
    let sampling = SamplingAdapter::new(
        SamplingModelSettings::default(),
        &horizons,
        MIN_HISTORY,
        Box::new(SamplerLoader {
            residency: residency.clone(),
            poisoned_last,
        }),
    )
    .expect("sampling adapter");
    InferenceOrchestrator::new(Box::new(point), Box::new(sampling))
}

fn histories() -> Histories {
    let mut histories = Histories::new();
    histories.insert("AAA".to_string(), vec![100.0; 400]);
    histories.insert("BBB".to_string(), (0..300).map(|idx| 50.0 + idx as f64 * 0.1).collect());
    histories.insert("CCC".to_string(), vec![20.0; 60]);
    histories.insert("TINY".to_string(), vec![10.0; 10]);
    histories
}

#[test]
fn models_are_never_resident_together() {
    ensure_test_env();
    let residency = Residency::default();
    let orchestrator = orchestrator(&residency, false, None);

    orchestrator.predict_all(&histories());

    assert_eq!(orchestrator.residency().peak(), 1);
    assert_eq!(orchestrator.residency().current(), 0);
    assert_eq!(residency.max.load(Ordering::SeqCst), 1);
    assert_eq!(
        residency.events(),
        vec![
            "load timesfm",
            "release timesfm",
            "load chronos",
            "release chronos"
        ]
    );
}

#[test]
fn short_histories_are_omitted_and_results_merge_per_model() {
    ensure_test_env();
    let residency = Residency::default();
    let results = orchestrator(&residency, false, None).predict_all(&histories());

    let tickers: Vec<&str> = results.keys().map(String::as_str).collect();
    assert_eq!(tickers, vec!["AAA", "BBB", "CCC"]);
    for per_model in results.values() {
        let models: Vec<&str> = per_model.keys().map(String::as_str).collect();
        assert_eq!(models, vec!["chronos", "timesfm"]);
        for forecast in per_model.values() {
            let keys: Vec<&str> = forecast.iter().map(|(key, _)| key).collect();
            assert_eq!(keys, vec!["1d", "1m", "1w", "1y", "6m"]);
        }
    }

    let aaa = &results["AAA"];
    assert!((aaa["timesfm"].get("1d").unwrap() - 1.0).abs() < 1e-9);
    assert!((aaa["timesfm"].get("1y").unwrap() - 252.0).abs() < 1e-9);
    for (_, growth) in aaa["chronos"].iter() {
        assert!((growth - 2.0).abs() < 1e-9);
    }
}

#[test]
fn point_load_failure_leaves_empty_point_maps() {
    ensure_test_env();
    let residency = Residency::default();
    let orchestrator = orchestrator(&residency, true, None);
    let results = orchestrator.predict_all(&histories());

    assert_eq!(results.len(), 3);
    for per_model in results.values() {
        assert!(per_model["timesfm"].is_empty());
        assert_eq!(per_model["chronos"].len(), 5);
    }
    assert_eq!(residency.events(), vec!["load chronos", "release chronos"]);
    assert_eq!(orchestrator.residency().peak(), 1);
}

#[test]
fn sampling_failure_for_one_instrument_only_drops_that_instrument() {
    ensure_test_env();
    let residency = Residency::default();
    let results = orchestrator(&residency, false, Some(20.0)).predict_all(&histories());

    assert_eq!(results.len(), 3);
    assert!(results["CCC"]["chronos"].is_empty());
    assert_eq!(results["CCC"]["timesfm"].len(), 5);
    assert_eq!(results["AAA"]["chronos"].len(), 5);
    assert_eq!(results["BBB"]["chronos"].len(), 5);
}
