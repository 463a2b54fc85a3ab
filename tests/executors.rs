use std::{
    sync::{
        Arc, Mutex,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use tokio::time::Instant;
use volley::{
    IterationError, MetricsAggregator, Scenario, Scheduler, Stat, VuContext, Workload,
    aggregate::{Aggregate, TrendAggregate},
    executor::{ConstantArrivalRate, ConstantVus, RampingVus, Stage},
    metric::names,
    workload::from_fn,
};

/// Tracks how many iterations run at the same time.
#[derive(Clone, Default)]
struct Concurrency {
    running: Arc<AtomicU64>,
    peak: Arc<AtomicU64>,
}

impl Concurrency {
    async fn during(&self, work: Duration) {
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(work).await;
        self.running.fetch_sub(1, Ordering::SeqCst);
    }

    fn peak(&self) -> u64 {
        self.peak.load(Ordering::SeqCst)
    }
}

fn scheduler(scenario: Scenario) -> Scheduler {
    Scheduler::builder()
        .scenarios(vec![scenario])
        .aggregator(Arc::new(MetricsAggregator::with_shards(4)))
        .build()
}

#[tokio::test(start_paused = true)]
async fn constant_vus_runs_back_to_back_iterations() {
    let concurrency = Concurrency::default();
    let scenario = Scenario::builder()
        .name("vus".to_string())
        .executor(
            ConstantVus::builder()
                .vus(10)
                .duration(Duration::from_secs(2))
                .build()
                .into(),
        )
        .build();

    let c = concurrency.clone();
    let summary = scheduler(scenario)
        .run(from_fn(move || {
            let c = c.clone();
            async move { c.during(Duration::from_millis(10)).await }
        }))
        .await
        .unwrap();

    let stats = summary.scenarios["vus"];
    // 10 VUs x 2000ms / 10ms, give or take the last iteration of each VU
    assert!(
        (1_900..=2_010).contains(&stats.completed),
        "completed {}",
        stats.completed
    );
    assert_eq!(stats.dropped, 0);
    assert_eq!(stats.failed, 0);
    assert!(concurrency.peak() <= 10);
    assert_eq!(stats.peak_vus, 10);
    assert_eq!(
        summary.value(names::ITERATIONS, "count"),
        Some(stats.completed as f64)
    );
    assert_eq!(summary.value(names::DROPPED_ITERATIONS, "count"), None);
}

#[tokio::test(start_paused = true)]
async fn arrival_rate_drops_instead_of_queueing() {
    let concurrency = Concurrency::default();
    let scenario = Scenario::builder()
        .name("rate".to_string())
        .executor(
            ConstantArrivalRate::builder()
                .rate(100)
                .time_unit(Duration::from_secs(1))
                .duration(Duration::from_secs(1))
                .max_vus(5)
                .build()
                .into(),
        )
        .build();

    let c = concurrency.clone();
    let summary = scheduler(scenario)
        .run(from_fn(move || {
            let c = c.clone();
            async move { c.during(Duration::from_millis(200)).await }
        }))
        .await
        .unwrap();

    let stats = summary.scenarios["rate"];
    let started_or_dropped = stats.completed + stats.dropped;
    assert!(
        (95..=101).contains(&started_or_dropped),
        "completed {} dropped {}",
        stats.completed,
        stats.dropped
    );
    // five VUs, 200ms each: about 25 iterations fit in one second
    assert!(stats.completed <= 35, "completed {}", stats.completed);
    assert!(stats.dropped >= 60, "dropped {}", stats.dropped);
    assert!(stats.peak_vus <= 5);
    assert!(concurrency.peak() <= 5);
    assert_eq!(
        summary.value(names::DROPPED_ITERATIONS, "count"),
        Some(stats.dropped as f64)
    );
    assert_eq!(summary.value(names::VUS, "max"), Some(5.0));
    assert_eq!(summary.value(names::VUS, "value"), Some(0.0));
}

#[tokio::test(start_paused = true)]
async fn arrival_rate_keeps_pace_when_vus_suffice() {
    let scenario = Scenario::builder()
        .name("paced".to_string())
        .executor(
            ConstantArrivalRate::builder()
                .rate(50)
                .duration(Duration::from_secs(4))
                .pre_allocated_vus(2)
                .max_vus(10)
                .build()
                .into(),
        )
        .build();

    let summary = scheduler(scenario)
        .run(from_fn(|| async {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }))
        .await
        .unwrap();

    let stats = summary.scenarios["paced"];
    // only the iterations that found the pool empty while it grew are dropped
    assert!(stats.dropped <= 8, "dropped {}", stats.dropped);
    assert!(
        (198..=201).contains(&(stats.completed + stats.dropped)),
        "completed {} dropped {}",
        stats.completed,
        stats.dropped
    );
    // 50/s x 50ms needs about 3 VUs at a time; the pool grew past its 2 pre-allocated
    assert!((3..=10).contains(&stats.peak_vus), "peak {}", stats.peak_vus);
}

/// Every VU takes `setup` to initialize; iterations record when they start.
struct SlowSetup {
    setup: Duration,
    work: Duration,
    starts: Arc<Mutex<Vec<Instant>>>,
}

impl Workload for SlowSetup {
    type Vu = ();

    async fn init_vu(&self, _ctx: &VuContext) {
        tokio::time::sleep(self.setup).await;
    }

    async fn iteration(&self, _vu: &mut (), _ctx: &VuContext) -> Result<(), IterationError> {
        self.starts.lock().unwrap().push(Instant::now());
        tokio::time::sleep(self.work).await;
        Ok(())
    }
}

#[tokio::test(start_paused = true)]
async fn arrival_rate_holds_pace_while_the_pool_grows_slowly() {
    let starts = Arc::new(Mutex::new(Vec::new()));
    let scenario = Scenario::builder()
        .name("growing".to_string())
        .executor(
            ConstantArrivalRate::builder()
                .rate(100)
                .duration(Duration::from_secs(1))
                .pre_allocated_vus(1)
                .max_vus(20)
                .build()
                .into(),
        )
        .build();

    let summary = scheduler(scenario)
        .run(SlowSetup {
            setup: Duration::from_millis(100),
            work: Duration::from_millis(10),
            starts: Arc::clone(&starts),
        })
        .await
        .unwrap();

    let stats = summary.scenarios["growing"];
    let due = stats.completed + stats.dropped;
    assert!(
        (98..=102).contains(&due),
        "completed {} dropped {}",
        stats.completed,
        stats.dropped
    );
    assert!(stats.peak_vus <= 20);

    let mut starts = starts.lock().unwrap().clone();
    starts.sort();
    let first = starts[0];
    assert!(
        starts.iter().all(|s| *s <= first + Duration::from_secs(1)),
        "an iteration started after the scenario ended"
    );
    // one iteration per 10ms tick, never a burst of late ones
    let most_at_once = starts
        .chunk_by(|a, b| a == b)
        .map(<[Instant]>::len)
        .max()
        .unwrap();
    assert!(most_at_once <= 2, "{most_at_once} iterations started at once");
    let early = starts
        .iter()
        .filter(|s| **s < first + Duration::from_millis(300))
        .count();
    assert!(early >= 10, "only {early} iterations in the first 300ms");
}

#[tokio::test(start_paused = true)]
async fn ramping_vus_stay_under_the_largest_target() {
    let concurrency = Concurrency::default();
    let scenario = Scenario::builder()
        .name("ramp".to_string())
        .executor(
            RampingVus::builder()
                .start_vus(0)
                .stages(vec![
                    Stage::new(Duration::from_secs(1), 8),
                    Stage::new(Duration::from_secs(1), 8),
                    Stage::new(Duration::from_secs(1), 0),
                ])
                .build()
                .into(),
        )
        .build();

    let c = concurrency.clone();
    let summary = scheduler(scenario)
        .run(from_fn(move || {
            let c = c.clone();
            async move { c.during(Duration::from_millis(20)).await }
        }))
        .await
        .unwrap();

    let stats = summary.scenarios["ramp"];
    assert_eq!(concurrency.peak(), 8);
    assert_eq!(stats.peak_vus, 8);
    assert_eq!(stats.interrupted, 0);
    assert!(stats.completed > 0);
}

#[test]
fn summary_statistics_are_ordered_for_any_sample_set() {
    // a few differently shaped synthetic latency sets
    let sets: Vec<Vec<f64>> = vec![
        (1..=1_000).map(|i| i as f64).collect(),
        (0..5_000).map(|i| ((i * 7_919) % 10_007) as f64 / 3.0).collect(),
        (0..2_000)
            .map(|i| if i % 100 == 0 { 5_000.0 } else { 2.5 })
            .collect(),
        vec![42.0],
        (0..3_000).map(|i| (i as f64).powf(1.7) / 1_000.0).collect(),
    ];

    for values in sets {
        let mut trend = TrendAggregate::new();
        trend.aggregate(&values);
        let p = |q: f64| trend.percentile(q);
        assert!(trend.min <= p(50.0));
        assert!(p(50.0) <= p(95.0));
        assert!(p(95.0) <= p(99.0));
        assert!(p(99.0) <= trend.max);
        assert_eq!(trend.med(), p(50.0));

        let series = volley::aggregate::SeriesAggregate::Trend(trend.clone());
        assert_eq!(series.stat(&Stat::Min, 1.0), Some(trend.min));
        assert_eq!(series.stat(&Stat::Max, 1.0), Some(trend.max));
    }
}
