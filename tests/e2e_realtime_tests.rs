//! End-to-end scenarios across the realtime and performance stacks,
//! composed through public APIs only: the publisher fanning out to sinks,
//! trackers emitting events, and the monitor feeding the scheduler and
//! alert manager.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use storyweave_core::agents::AgentKind;
use storyweave_core::events::{Event, EventPayload, EventType, WorkflowStatus};
use storyweave_core::performance::alerts::{
    Alert, AlertManager, AlertNotifier, AlertRule, AlertSeverity, AlertState, Comparison,
    MetricQuery, MetricStatistic, QueryEvaluator,
};
use storyweave_core::performance::monitor::{LatencyMonitor, OperationClass};
use storyweave_core::performance::scheduler::{
    AgentCoordinator, SchedulingStrategy, WorkflowRequest,
};
use storyweave_core::platform::config::{EventSettings, FeedbackSettings, OptimizationSettings};
use storyweave_core::realtime::feedback::{FeedbackTracker, OperationUpdate};
use storyweave_core::realtime::publisher::{EventPublisher, EventSink};
use storyweave_core::realtime::workflow::{Milestone, WorkflowStage, WorkflowTracker};

/// Sink that records everything the publisher fans out.
#[derive(Default)]
struct CaptureSink {
    events: Mutex<Vec<Event>>,
}

impl CaptureSink {
    fn of_type(&self, event_type: EventType) -> Vec<Event> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.event_type() == event_type)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl EventSink for CaptureSink {
    async fn deliver(&self, event: &Event) -> storyweave_core::Result<usize> {
        self.events.lock().push(event.clone());
        Ok(1)
    }
}

fn publisher_with_sink() -> (Arc<EventPublisher>, Arc<CaptureSink>) {
    let publisher = Arc::new(EventPublisher::new(EventSettings::default(), true, None));
    let sink = Arc::new(CaptureSink::default());
    publisher.register_sink(sink.clone());
    (publisher, sink)
}

#[tokio::test]
async fn test_happy_path_workflow_progress_reaches_subscribers() {
    let (publisher, sink) = publisher_with_sink();
    let tracker = WorkflowTracker::new(&FeedbackSettings::default(), publisher);

    let milestones = vec![
        Milestone::new("init", "Initialization", WorkflowStage::Initializing, 0.2),
        Milestone::new("exec", "Execution", WorkflowStage::Executing, 0.6),
        Milestone::new("final", "Finalization", WorkflowStage::Finalizing, 0.2),
    ];
    let workflow_id = tracker
        .start_workflow("story_generation", Some("user-1".into()), milestones, Some(3))
        .await
        .unwrap();

    tracker.complete_milestone(&workflow_id, "init").await.unwrap();
    tracker.complete_milestone(&workflow_id, "exec").await.unwrap();
    tracker.complete_milestone(&workflow_id, "final").await.unwrap();
    tracker.complete_workflow(&workflow_id).await.unwrap();

    let events = sink.of_type(EventType::WorkflowProgress);
    assert!(events.len() >= 4);

    let progress: Vec<f64> = events
        .iter()
        .filter_map(|e| e.progress_percentage())
        .collect();
    assert!(progress.windows(2).all(|w| w[0] <= w[1]));
    for expected in [20.0, 80.0, 100.0] {
        assert!(
            progress.iter().any(|p| (p - expected).abs() < 1e-6),
            "missing progress {expected}% in {progress:?}"
        );
    }

    match &events.last().unwrap().payload {
        EventPayload::WorkflowProgress { status, user_id, .. } => {
            assert_eq!(*status, WorkflowStatus::Completed);
            assert_eq!(user_id.as_deref(), Some("user-1"));
        }
        other => panic!("unexpected payload: {other:?}"),
    }
}

#[tokio::test]
async fn test_operation_feedback_stream_is_monotonic_and_terminal() {
    let (publisher, sink) = publisher_with_sink();
    let tracker = FeedbackTracker::new(FeedbackSettings::default(), publisher);

    let operation_id = tracker
        .start_operation("narrative_render", Some("user-2".into()), Some(4), None)
        .await;
    for steps in 1..=4 {
        tracker
            .update_operation(
                &operation_id,
                OperationUpdate {
                    stage: Some("executing".into()),
                    steps_done: Some(steps),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
    }
    tracker.complete_operation(&operation_id, None, true).await;

    let events = sink.of_type(EventType::ProgressiveFeedback);
    assert_eq!(events.len(), 6); // start + 4 updates + completion

    let progress: Vec<f64> = events
        .iter()
        .filter_map(|e| e.progress_percentage())
        .collect();
    assert_eq!(progress[0], 0.0);
    assert!(progress.windows(2).all(|w| w[0] <= w[1]));
    assert_eq!(*progress.last().unwrap(), 100.0);
}

/// Evaluator with a programmable value, standing in for live metrics.
struct ScriptedEvaluator {
    value: Mutex<f64>,
}

impl QueryEvaluator for ScriptedEvaluator {
    fn evaluate(&self, query: &MetricQuery) -> Vec<(BTreeMap<String, String>, f64)> {
        vec![(
            BTreeMap::from([(
                "operation_class".to_string(),
                query.class.as_str().to_string(),
            )]),
            *self.value.lock(),
        )]
    }
}

#[derive(Default)]
struct CountingNotifier {
    fires: AtomicUsize,
    resolves: AtomicUsize,
}

#[async_trait]
impl AlertNotifier for CountingNotifier {
    async fn notify(&self, alert: &Alert) {
        match alert.status {
            AlertState::Active => self.fires.fetch_add(1, Ordering::SeqCst),
            _ => self.resolves.fetch_add(1, Ordering::SeqCst),
        };
    }
}

#[tokio::test]
async fn test_alert_flap_within_cooldown_notifies_once_each_way() {
    let evaluator = Arc::new(ScriptedEvaluator {
        value: Mutex::new(2.5),
    });
    let manager = AlertManager::new(evaluator.clone(), 1.0, 300.0);
    for rule in storyweave_core::performance::alerts::default_rules() {
        manager.remove_rule(&rule.name);
    }
    manager.add_rule(AlertRule {
        name: "workflow_p95".to_string(),
        description: "p95 above target".to_string(),
        query: MetricQuery {
            class: OperationClass::WorkflowExecution,
            statistic: MetricStatistic::P95,
        },
        threshold: 2.0,
        comparison: Comparison::Gt,
        severity: AlertSeverity::Warning,
        duration: 60,
        enabled: true,
        labels: BTreeMap::new(),
        annotations: BTreeMap::new(),
    });

    let notifier = Arc::new(CountingNotifier::default());
    manager.add_notifier(notifier.clone());

    // Fires once while the metric stays high.
    manager.check_all_rules().await;
    manager.check_all_rules().await;

    // Drops, climbs again, and drops again, all within the cooldown.
    *evaluator.value.lock() = 1.0;
    manager.check_all_rules().await;
    *evaluator.value.lock() = 2.5;
    manager.check_all_rules().await;
    *evaluator.value.lock() = 1.0;
    manager.check_all_rules().await;

    assert_eq!(notifier.fires.load(Ordering::SeqCst), 1);
    assert_eq!(notifier.resolves.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_scheduler_selects_fast_agents_from_observed_latencies() {
    let monitor = Arc::new(LatencyMonitor::new(30.0, 1000, 2.0));
    let settings = OptimizationSettings {
        strategy: SchedulingStrategy::Adaptive,
        ..OptimizationSettings::default()
    };
    let coordinator = AgentCoordinator::new(settings, Arc::clone(&monitor));

    coordinator.register_agent("ipa-fast", AgentKind::InputProcessor, 5);
    coordinator.register_agent("ipa-slow", AgentKind::InputProcessor, 5);
    coordinator.register_agent("wba-0", AgentKind::WorldBuilder, 5);
    coordinator.register_agent("nga-0", AgentKind::NarrativeGenerator, 5);

    // Observed history: one input processor is consistently faster.
    for _ in 0..20 {
        monitor.record(OperationClass::AgentProcessing, Some("ipa-fast"), 0.2, true);
        monitor.record(OperationClass::AgentProcessing, Some("ipa-slow"), 3.0, true);
    }
    coordinator.refresh_profiles();

    let request = WorkflowRequest {
        request_id: "story-req".to_string(),
        workflow_type: "story_generation".to_string(),
        priority: 2,
        estimated_duration: 1.0,
        required_agents: vec![
            AgentKind::InputProcessor,
            AgentKind::WorldBuilder,
            AgentKind::NarrativeGenerator,
        ],
        user_id: Some("user-1".into()),
        deadline: None,
        metadata: HashMap::new(),
    };

    // Idle system: the adaptive strategy goes fastest-first.
    let decision = coordinator.schedule_workflow(request).unwrap();
    assert_eq!(
        decision.selected_agents[&AgentKind::InputProcessor],
        "ipa-fast"
    );
    assert_eq!(decision.selected_agents.len(), 3);

    // Reservation bumped each selected agent's load.
    assert_eq!(coordinator.profile("ipa-fast").unwrap().current_load, 1);
    coordinator.release_agents("story-req");
    assert_eq!(coordinator.profile("ipa-fast").unwrap().current_load, 0);
}

#[tokio::test]
async fn test_event_wire_format_round_trip() {
    let (publisher, sink) = publisher_with_sink();
    publisher
        .publish_workflow_progress(
            "wf-9",
            "story_generation",
            WorkflowStatus::Running,
            42.0,
            Some("executing".into()),
            Some(5),
            Some(2),
            None,
            Some("user-3".into()),
        )
        .await;

    let event = sink.of_type(EventType::WorkflowProgress).remove(0);
    let wire = serde_json::to_string(&event).unwrap();
    let decoded: Event = serde_json::from_str(&wire).unwrap();
    assert_eq!(decoded, event);

    let value: serde_json::Value = serde_json::from_str(&wire).unwrap();
    assert_eq!(value["event_type"], "workflow_progress");
    assert_eq!(value["workflow_id"], "wf-9");
    assert_eq!(value["user_id"], "user-3");
}

#[tokio::test]
async fn test_publisher_counts_survive_sink_failures() {
    struct FailingSink;

    #[async_trait]
    impl EventSink for FailingSink {
        async fn deliver(&self, _event: &Event) -> storyweave_core::Result<usize> {
            Err(storyweave_core::FabricError::Internal("sink down".into()))
        }
    }

    let publisher = Arc::new(EventPublisher::new(EventSettings::default(), true, None));
    publisher.register_sink(Arc::new(FailingSink));

    let ok = publisher
        .publish_event(Event::heartbeat("e2e", None, None, None))
        .await;
    assert!(!ok);

    let stats = publisher.stats();
    assert_eq!(stats.events_failed, 1);
    // The event still landed in the ring buffer.
    assert_eq!(stats.buffer_len, 1);
}
