#[cfg(test)]
mod tests {
    use crate::task::*;
    use async_trait::async_trait;
    use std::future::Future;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use tokio::sync::Notify;

    const TEST_TIMEOUT: Duration = Duration::from_secs(5);

    async fn within<F: Future>(future: F) -> F::Output {
        tokio::time::timeout(TEST_TIMEOUT, future)
            .await
            .expect("timed out waiting for the queue")
    }

    fn queue() -> TaskQueue {
        TaskQueue::new(QueueConfig::default())
    }

    fn states(task: &Task) -> Vec<TaskState> {
        task.state_history().iter().map(|entry| entry.state).collect()
    }

    fn entered_at(task: &Task, state: TaskState) -> chrono::DateTime<chrono::Utc> {
        task.state_history()
            .into_iter()
            .find(|entry| entry.state == state)
            .map(|entry| entry.at)
            .unwrap_or_else(|| panic!("task never entered {}", state))
    }

    /// Always fails, like a precondition that is never met
    struct FailedCondition;

    #[async_trait]
    impl Condition for FailedCondition {
        fn name(&self) -> String {
            "Failed Condition".to_string()
        }

        async fn evaluate(&self, _task: &Task) -> ConditionResult {
            ConditionResult::Failed(TaskError::ExecutionFailed("condition failed".to_string()))
        }
    }

    /// Counts evaluations and resolves with a fixed outcome after a delay
    struct CountingCondition {
        evaluations: Arc<AtomicUsize>,
        failure: Option<String>,
        delay: Duration,
    }

    impl CountingCondition {
        fn new(evaluations: &Arc<AtomicUsize>, failure: Option<&str>) -> Self {
            Self {
                evaluations: Arc::clone(evaluations),
                failure: failure.map(str::to_string),
                delay: Duration::ZERO,
            }
        }

        fn delayed(mut self, delay: Duration) -> Self {
            self.delay = delay;
            self
        }
    }

    #[async_trait]
    impl Condition for CountingCondition {
        fn name(&self) -> String {
            "Counting".to_string()
        }

        async fn evaluate(&self, _task: &Task) -> ConditionResult {
            self.evaluations.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            match &self.failure {
                Some(message) => ConditionResult::Failed(TaskError::ExecutionFailed(message.clone())),
                None => ConditionResult::Satisfied,
            }
        }
    }

    #[derive(Default)]
    struct RecordingObserver {
        started: AtomicUsize,
        produced: AtomicUsize,
        finished: Mutex<Vec<Vec<String>>>,
    }

    impl RecordingObserver {
        fn finish_calls(&self) -> Vec<Vec<String>> {
            self.finished.lock().unwrap().clone()
        }
    }

    impl Observer for RecordingObserver {
        fn task_did_start(&self, _task: &Task) {
            self.started.fetch_add(1, Ordering::SeqCst);
        }

        fn task_did_produce(&self, _task: &Task, _produced: &Task) {
            self.produced.fetch_add(1, Ordering::SeqCst);
        }

        fn task_did_finish(&self, _task: &Task, errors: &[TaskError]) {
            self.finished
                .lock()
                .unwrap()
                .push(errors.iter().map(ToString::to_string).collect());
        }
    }

    #[derive(Default)]
    struct RecordingDelegate {
        added: Mutex<Vec<uuid::Uuid>>,
        finished: Mutex<Vec<(uuid::Uuid, usize)>>,
    }

    impl QueueDelegate for RecordingDelegate {
        fn will_add(&self, _queue: &TaskQueue, item: &QueueItem) {
            self.added.lock().unwrap().push(item.id());
        }

        fn task_finished(&self, _queue: &TaskQueue, item: &QueueItem, errors: &[TaskError]) {
            self.finished.lock().unwrap().push((item.id(), errors.len()));
        }
    }

    fn flagged_task(ran: &Arc<AtomicBool>) -> Task {
        let ran = Arc::clone(ran);
        Task::from_fn(move |_| {
            let ran = Arc::clone(&ran);
            async move {
                ran.store(true, Ordering::SeqCst);
                Ok(())
            }
        })
    }

    fn blocked_task(release: &Arc<Notify>) -> Task {
        let release = Arc::clone(release);
        Task::from_fn(move |_| {
            let release = Arc::clone(&release);
            async move {
                release.notified().await;
                Ok(())
            }
        })
    }

    #[test]
    fn test_task_creation() {
        let task = Task::noop().with_name("Fetch weather");

        assert_eq!(task.name().as_deref(), Some("Fetch weather"));
        assert_eq!(task.state(), TaskState::Initialized);
        assert!(task.conditions().is_empty());
        assert!(task.dependencies().is_empty());
        assert!(task.errors().is_empty());
        assert!(!task.is_enqueued());
        assert_eq!(task.quality_of_service(), QualityOfService::Default);
        assert_eq!(task, task.clone());
        assert_ne!(task, Task::noop());
    }

    #[test]
    fn test_initialized_task_is_ready_only_when_cancelled() {
        let task = Task::noop();
        assert!(!task.is_ready());

        task.cancel();
        assert!(task.is_ready());
        assert!(task.is_cancelled());
    }

    #[test]
    fn test_user_initiated_toggle() {
        let task = Task::noop();
        task.set_user_initiated(true);
        assert!(task.is_user_initiated());
        assert_eq!(task.quality_of_service(), QualityOfService::UserInitiated);

        task.set_user_initiated(false);
        assert_eq!(task.quality_of_service(), QualityOfService::Default);
    }

    #[test]
    #[should_panic(expected = "illegal state transition")]
    fn test_finishing_unqueued_task_is_a_contract_violation() {
        Task::noop().finish(Vec::new());
    }

    #[test]
    #[should_panic(expected = "cannot depend on itself")]
    fn test_self_dependency_is_rejected() {
        let task = Task::noop();
        task.add_dependency(&task.clone());
    }

    #[tokio::test]
    async fn test_noop_task_walks_every_state() {
        let queue = queue();
        let task = Task::noop().with_name("noop");

        queue.add_task(task.clone());
        within(task.wait_until_finished()).await;

        assert_eq!(
            states(&task),
            vec![
                TaskState::Initialized,
                TaskState::Pending,
                TaskState::EvaluatingConditions,
                TaskState::Ready,
                TaskState::Executing,
                TaskState::Finishing,
                TaskState::Finished,
            ]
        );
        assert!(task.errors().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_state_history_is_monotonic() {
        let queue = queue();
        let release = Arc::new(Notify::new());
        let blocker = blocked_task(&release);
        let tasks = vec![
            Task::noop(),
            Task::noop().with_condition(FailedCondition),
            Task::noop().with_dependency(&blocker),
            Task::noop().with_condition(ExclusiveCategory::new("monotonic")),
            Task::noop().with_condition(ExclusiveCategory::new("monotonic")),
        ];
        tasks[2].cancel();

        queue.add_task(blocker.clone());
        queue.add_tasks(tasks.clone());
        release.notify_one();
        within(queue.wait_until_all_finished()).await;

        for task in tasks.iter().chain(std::iter::once(&blocker)) {
            let history = states(task);
            assert_eq!(history.first(), Some(&TaskState::Initialized));
            assert_eq!(history.last(), Some(&TaskState::Finished));
            for pair in history.windows(2) {
                assert!(pair[0] < pair[1], "{:?} revisits a state", history);
                assert!(pair[0].can_transition_to(pair[1]), "{:?}", history);
            }
        }
    }

    #[tokio::test]
    async fn test_finish_is_at_most_once() {
        struct FinishThrice;

        #[async_trait]
        impl TaskBody for FinishThrice {
            async fn execute(&self, task: &Task) {
                task.finish(vec![TaskError::ExecutionFailed("first".into())]);
                task.finish(vec![TaskError::ExecutionFailed("second".into())]);
                task.finish(Vec::new());
            }
        }

        let queue = queue();
        let observer = Arc::new(RecordingObserver::default());
        let task = Task::new(FinishThrice).with_observer(Arc::clone(&observer));

        queue.add_task(task.clone());
        within(task.wait_until_finished()).await;

        assert_eq!(
            observer.finish_calls(),
            vec![vec!["execution failed: first".to_string()]]
        );
        assert_eq!(task.errors().len(), 1);
    }

    #[tokio::test]
    async fn test_every_condition_is_evaluated_once() {
        let queue = queue();
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));
        let third = Arc::new(AtomicUsize::new(0));
        let ran = Arc::new(AtomicBool::new(false));
        let task = flagged_task(&ran)
            .with_condition(CountingCondition::new(&first, Some("first")))
            .with_condition(
                CountingCondition::new(&second, Some("second")).delayed(Duration::from_millis(20)),
            )
            .with_condition(CountingCondition::new(&third, None));

        queue.add_task(task.clone());
        within(task.wait_until_finished()).await;

        assert_eq!(first.load(Ordering::SeqCst), 1);
        assert_eq!(second.load(Ordering::SeqCst), 1);
        assert_eq!(third.load(Ordering::SeqCst), 1);
        let messages: Vec<String> = task.errors().iter().map(ToString::to_string).collect();
        assert_eq!(
            messages,
            vec!["execution failed: first", "execution failed: second"]
        );
        assert!(!ran.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_failed_condition_skips_work_and_reports_error() {
        let queue = queue();
        let observer = Arc::new(RecordingObserver::default());
        let satisfied = Arc::new(AtomicUsize::new(0));
        let ran = Arc::new(AtomicBool::new(false));
        let task = flagged_task(&ran)
            .with_condition(FailedCondition)
            .with_condition(CountingCondition::new(&satisfied, None))
            .with_observer(Arc::clone(&observer));

        queue.add_task(task.clone());
        within(task.wait_until_finished()).await;

        assert!(!ran.load(Ordering::SeqCst));
        assert_eq!(observer.started.load(Ordering::SeqCst), 0);
        assert_eq!(
            observer.finish_calls(),
            vec![vec!["execution failed: condition failed".to_string()]]
        );
        assert!(!states(&task).contains(&TaskState::Executing));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_exclusive_tasks_run_one_at_a_time_in_order() {
        let queue = queue();
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let order = Arc::new(Mutex::new(Vec::new()));

        let make = |name: &str| {
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            let order = Arc::clone(&order);
            Task::from_fn(move |task| {
                let running = Arc::clone(&running);
                let peak = Arc::clone(&peak);
                let order = Arc::clone(&order);
                async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(30)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                    order.lock().unwrap().push(task.label());
                    Ok(())
                }
            })
            .with_name(name)
            .with_condition(ExclusiveCategory::new("Exclusive"))
        };

        queue.add_tasks(vec![make("A"), make("B"), make("C")]);
        within(queue.wait_until_all_finished()).await;

        assert_eq!(peak.load(Ordering::SeqCst), 1);
        assert_eq!(*order.lock().unwrap(), vec!["A", "B", "C"]);
        assert!(queue.coordinator().categories().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_exclusive_task_starts_after_previous_finished() {
        let queue = queue();
        let first = Task::from_fn(|_| async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok(())
        })
        .with_condition(ExclusiveCategory::new("Exclusive"));
        let second = Task::noop().with_condition(ExclusiveCategory::new("Exclusive"));

        queue.add_task(first.clone());
        tokio::time::sleep(Duration::from_millis(10)).await;
        queue.add_task(second.clone());
        within(queue.wait_until_all_finished()).await;

        assert!(entered_at(&second, TaskState::Executing) >= entered_at(&first, TaskState::Finished));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_typed_exclusivity_shares_coordinator_across_queues() {
        enum Presentation {}

        let coordinator = Arc::new(ExclusivityCoordinator::new());
        let left = TaskQueue::with_coordinator(QueueConfig::default(), Arc::clone(&coordinator));
        let right = TaskQueue::with_coordinator(QueueConfig::default(), Arc::clone(&coordinator));
        let first = Task::from_fn(|_| async {
            tokio::time::sleep(Duration::from_millis(40)).await;
            Ok(())
        })
        .with_condition(MutuallyExclusive::<Presentation>::new());
        let second = Task::noop().with_condition(MutuallyExclusive::<Presentation>::new());

        left.add_task(first.clone());
        right.add_task(second.clone());
        assert_eq!(second.dependencies(), vec![first.clone()]);

        within(left.wait_until_all_finished()).await;
        within(right.wait_until_all_finished()).await;
        assert!(entered_at(&second, TaskState::Executing) >= entered_at(&first, TaskState::Finished));
        assert!(coordinator.categories().is_empty());
    }

    #[tokio::test]
    async fn test_produced_task_runs_without_blocking_parent() {
        let queue = queue();
        let release = Arc::new(Notify::new());
        let child = blocked_task(&release).with_name("child");
        let observer = Arc::new(RecordingObserver::default());
        let produced = child.clone();
        let parent = Task::from_fn(move |task| {
            let produced = produced.clone();
            async move {
                task.produce(produced);
                Ok(())
            }
        })
        .with_observer(Arc::clone(&observer));

        queue.add_task(parent.clone());
        within(parent.wait_until_finished()).await;

        assert_eq!(observer.produced.load(Ordering::SeqCst), 1);
        assert!(child.is_enqueued());
        assert!(!child.is_finished());

        release.notify_one();
        within(child.wait_until_finished()).await;
        within(queue.wait_until_all_finished()).await;
        assert!(child.errors().is_empty());
    }

    #[tokio::test]
    async fn test_did_finish_can_produce_follow_up_work() {
        struct ReportOnFailure {
            report: Task,
        }

        #[async_trait]
        impl TaskBody for ReportOnFailure {
            async fn execute(&self, task: &Task) {
                task.finish_with_error(Some(TaskError::ExecutionFailed("timeout".into())));
            }

            fn did_finish(&self, task: &Task, errors: &[TaskError]) {
                if !errors.is_empty() {
                    task.produce(self.report.clone());
                }
            }
        }

        let queue = queue();
        let report = Task::noop().with_name("report");
        let task = Task::new(ReportOnFailure {
            report: report.clone(),
        });

        queue.add_task(task.clone());
        within(queue.wait_until_all_finished()).await;

        assert!(report.is_finished());
        assert_eq!(task.errors().len(), 1);
    }

    #[tokio::test]
    async fn test_cancel_before_dependencies_clear() {
        let queue = queue();
        let release = Arc::new(Notify::new());
        let blocker = blocked_task(&release);
        let ran = Arc::new(AtomicBool::new(false));
        let observer = Arc::new(RecordingObserver::default());
        let task = flagged_task(&ran)
            .with_dependency(&blocker)
            .with_observer(Arc::clone(&observer));

        queue.add_tasks(vec![blocker.clone(), task.clone()]);
        assert_eq!(task.state(), TaskState::Pending);

        task.cancel_with_error(TaskError::Cancelled("user left the screen".into()));
        within(task.wait_until_finished()).await;

        assert!(!ran.load(Ordering::SeqCst));
        assert!(!blocker.is_finished());
        assert_eq!(
            states(&task),
            vec![
                TaskState::Initialized,
                TaskState::Pending,
                TaskState::Finishing,
                TaskState::Finished,
            ]
        );
        assert_eq!(
            observer.finish_calls(),
            vec![vec!["cancelled: user left the screen".to_string()]]
        );

        release.notify_one();
        within(queue.wait_until_all_finished()).await;
    }

    #[tokio::test]
    async fn test_cancel_during_condition_evaluation() {
        let queue = queue();
        let evaluations = Arc::new(AtomicUsize::new(0));
        let ran = Arc::new(AtomicBool::new(false));
        let task = flagged_task(&ran).with_condition(
            CountingCondition::new(&evaluations, None).delayed(Duration::from_millis(50)),
        );

        queue.add_task(task.clone());
        within(task.wait_for_state(TaskState::EvaluatingConditions)).await;
        task.cancel();
        within(task.wait_until_finished()).await;

        assert!(!ran.load(Ordering::SeqCst));
        assert_eq!(evaluations.load(Ordering::SeqCst), 1);
        let errors = task.errors();
        assert_eq!(errors.len(), 1);
        assert!(matches!(errors[0], TaskError::ConditionFailed));
        assert!(errors[0].is_cancellation());
    }

    #[tokio::test]
    async fn test_cancelled_task_drains_when_enqueued() {
        let queue = queue();
        let ran = Arc::new(AtomicBool::new(false));
        let task = flagged_task(&ran);
        task.cancel();

        queue.add_task(task.clone());
        within(task.wait_until_finished()).await;

        assert!(!ran.load(Ordering::SeqCst));
        assert!(task.errors().is_empty());
    }

    #[tokio::test]
    async fn test_observer_sees_every_event() {
        let queue = queue();
        let observer = Arc::new(RecordingObserver::default());
        let task = Task::noop().with_observer(Arc::clone(&observer));

        // Produced before enqueueing: only the attached observer hears about it.
        task.produce(Task::noop());
        queue.add_task(task.clone());
        within(task.wait_until_finished()).await;

        assert_eq!(observer.started.load(Ordering::SeqCst), 1);
        assert_eq!(observer.produced.load(Ordering::SeqCst), 1);
        assert_eq!(observer.finish_calls(), vec![Vec::<String>::new()]);
    }

    #[tokio::test]
    async fn test_condition_dependency_is_enqueued_and_runs_first() {
        let queue = queue();
        let lookup = Task::noop().with_name("lookup");
        let task = Task::noop().with_condition(DependencyCondition::new(lookup.clone()));

        queue.add_task(task.clone());
        assert!(lookup.is_enqueued());
        assert_eq!(task.dependencies(), vec![lookup.clone()]);
        within(queue.wait_until_all_finished()).await;

        assert!(task.errors().is_empty());
        assert!(entered_at(&task, TaskState::Executing) >= entered_at(&lookup, TaskState::Finished));
    }

    #[tokio::test]
    async fn test_failed_condition_dependency_blocks_work() {
        let queue = queue();
        let lookup = Task::from_fn(|_| async {
            Err(TaskError::UnreachableNetwork {
                host: "https://weather.test/".into(),
            })
        });
        let ran = Arc::new(AtomicBool::new(false));
        let task = flagged_task(&ran)
            .with_condition(DependencyCondition::new(lookup.clone()).with_name("Lookup"));

        queue.add_task(task.clone());
        within(queue.wait_until_all_finished()).await;

        assert!(!ran.load(Ordering::SeqCst));
        assert!(matches!(
            task.errors().as_slice(),
            [TaskError::ConditionNotSatisfied { condition, .. }] if condition == "Lookup"
        ));
    }

    #[tokio::test]
    async fn test_delegate_sees_tasks_and_plain_work() {
        let queue = queue();
        let delegate = Arc::new(RecordingDelegate::default());
        queue.set_delegate(delegate.clone());

        let ok = Task::noop();
        let failing = Task::noop().with_condition(FailedCondition);
        let work_ran = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&work_ran);

        queue.add_tasks(vec![ok.clone(), failing.clone()]);
        let work = queue.add_work("refresh", async move {
            flag.store(true, Ordering::SeqCst);
        });
        within(queue.wait_until_all_finished()).await;

        assert!(work_ran.load(Ordering::SeqCst));
        assert_eq!(work.name.as_deref(), Some("refresh"));
        assert_eq!(*delegate.added.lock().unwrap(), vec![ok.id(), failing.id(), work.id]);

        let finished = delegate.finished.lock().unwrap().clone();
        assert_eq!(finished.len(), 3);
        assert!(finished.contains(&(ok.id(), 0)));
        assert!(finished.contains(&(failing.id(), 1)));
        assert!(finished.contains(&(work.id, 0)));
    }

    #[tokio::test]
    async fn test_adding_a_task_twice_is_ignored() {
        let queue = queue();
        let delegate = Arc::new(RecordingDelegate::default());
        queue.set_delegate(delegate.clone());
        let task = Task::noop();

        queue.add_task(task.clone());
        queue.add_task(task.clone());
        within(queue.wait_until_all_finished()).await;

        assert_eq!(delegate.added.lock().unwrap().len(), 1);
        assert_eq!(delegate.finished.lock().unwrap().len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrency_limit_is_respected() {
        let queue = TaskQueue::new(QueueConfig {
            name: Some("serial".into()),
            max_concurrent_tasks: Some(1),
            default_quality_of_service: None,
        });
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        for _ in 0..4 {
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            queue.add_task(Task::from_fn(move |_| {
                let running = Arc::clone(&running);
                let peak = Arc::clone(&peak);
                async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                }
            }));
        }
        within(queue.wait_until_all_finished()).await;

        assert_eq!(peak.load(Ordering::SeqCst), 1);
        assert_eq!(queue.task_count(), 0);
    }

    #[tokio::test]
    async fn test_cancel_all_stops_waiting_tasks() {
        let queue = queue();
        let release = Arc::new(Notify::new());
        let blocker = blocked_task(&release);
        let ran = Arc::new(AtomicBool::new(false));
        let waiting = flagged_task(&ran).with_dependency(&blocker);

        queue.add_tasks(vec![blocker.clone(), waiting.clone()]);
        assert_eq!(queue.task_count(), 2);
        within(blocker.wait_for_state(TaskState::Executing)).await;

        queue.cancel_all();
        within(waiting.wait_until_finished()).await;
        assert!(!ran.load(Ordering::SeqCst));

        // Cancellation is advisory for work already running.
        release.notify_one();
        within(queue.wait_until_all_finished()).await;
        assert!(blocker.is_cancelled());
        assert!(blocker.errors().is_empty());
    }

    #[tokio::test]
    async fn test_queue_applies_default_quality_of_service() {
        let queue = TaskQueue::new(QueueConfig {
            default_quality_of_service: Some(QualityOfService::Utility),
            ..Default::default()
        });
        let plain = Task::noop();
        let urgent = Task::noop().with_quality_of_service(QualityOfService::UserInteractive);

        queue.add_tasks(vec![plain.clone(), urgent.clone()]);
        within(queue.wait_until_all_finished()).await;

        assert_eq!(plain.quality_of_service(), QualityOfService::Utility);
        assert_eq!(urgent.quality_of_service(), QualityOfService::UserInteractive);
    }

    #[tokio::test]
    async fn test_work_body_can_observe_cancellation() {
        let queue = queue();
        let task = Task::from_fn(|task| async move {
            task.cancelled().await;
            Err(TaskError::Cancelled("stopped early".into()))
        });

        queue.add_task(task.clone());
        within(task.wait_for_state(TaskState::Executing)).await;
        task.cancel();
        within(task.wait_until_finished()).await;

        assert!(matches!(task.errors().as_slice(), [TaskError::Cancelled(_)]));
    }

    #[tokio::test]
    #[should_panic(expected = "condition added")]
    async fn test_condition_after_enqueue_is_rejected() {
        let queue = queue();
        let task = Task::noop();
        queue.add_task(task.clone());
        within(task.wait_until_finished()).await;

        task.add_condition(FailedCondition);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_submission_keeps_category_exclusive() {
        const TASKS: usize = 16;
        let queue = queue();
        let (open, gate) = tokio::sync::watch::channel(false);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let tasks: Vec<Task> = (0..TASKS)
            .map(|index| {
                let gate = gate.clone();
                let running = Arc::clone(&running);
                let peak = Arc::clone(&peak);
                Task::from_fn(move |_| {
                    let mut gate = gate.clone();
                    let running = Arc::clone(&running);
                    let peak = Arc::clone(&peak);
                    async move {
                        let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        let _ = gate.wait_for(|open| *open).await;
                        tokio::task::yield_now().await;
                        running.fetch_sub(1, Ordering::SeqCst);
                        Ok(())
                    }
                })
                .with_name(format!("writer-{}", index))
                .with_condition(ExclusiveCategory::new("shared"))
            })
            .collect();

        let submitters: Vec<_> = tasks
            .chunks(TASKS / 4)
            .map(|chunk| {
                let queue = queue.clone();
                let chunk = chunk.to_vec();
                tokio::spawn(async move {
                    for task in chunk {
                        queue.add_task(task);
                        tokio::task::yield_now().await;
                    }
                })
            })
            .collect();
        for submitter in submitters {
            submitter.await.unwrap();
        }

        // Nothing finishes before the gate opens, so the chain is intact.
        let order = queue.coordinator().registered("shared");
        assert_eq!(order.len(), TASKS);
        let by_id: std::collections::HashMap<_, _> =
            tasks.iter().map(|task| (task.id(), task.clone())).collect();
        assert!(by_id[&order[0]].dependencies().is_empty());
        for pair in order.windows(2) {
            assert_eq!(by_id[&pair[1]].dependencies(), vec![by_id[&pair[0]].clone()]);
        }

        open.send_replace(true);
        within(queue.wait_until_all_finished()).await;

        assert_eq!(peak.load(Ordering::SeqCst), 1);
        assert!(queue.coordinator().categories().is_empty());
        for pair in order.windows(2) {
            assert!(
                entered_at(&by_id[&pair[1]], TaskState::Executing)
                    >= entered_at(&by_id[&pair[0]], TaskState::Finished)
            );
        }
    }

    #[tokio::test]
    async fn test_finished_task_releases_its_dependencies() {
        let queue = queue();
        let helper = Task::noop().with_name("helper");
        let first = Task::noop().with_condition(ExclusiveCategory::new("disk"));
        let second = Task::noop().with_condition(ExclusiveCategory::new("disk"));
        second.add_dependency(&helper);

        queue.add_tasks([helper.clone(), first.clone(), second.clone()]);
        assert_eq!(second.dependencies(), vec![helper.clone(), first.clone()]);
        within(queue.wait_until_all_finished()).await;

        assert!(second.is_finished());
        assert!(second.errors().is_empty());
        assert!(second.dependencies().is_empty());
        assert!(first.dependencies().is_empty());
    }

    fn panicking_task(message: &'static str) -> Task {
        Task::from_fn(move |_| async move {
            if !message.is_empty() {
                panic!("{}", message);
            }
            Ok(())
        })
    }

    /// Panics while evaluating
    struct BrittleCondition;

    #[async_trait]
    impl Condition for BrittleCondition {
        fn name(&self) -> String {
            "Brittle".to_string()
        }

        async fn evaluate(&self, _task: &Task) -> ConditionResult {
            panic!("lookup table missing");
        }
    }

    #[tokio::test]
    async fn test_panicking_body_finishes_with_error() {
        let queue = queue();
        let ran = Arc::new(AtomicBool::new(false));
        let broken = panicking_task("disk on fire").with_condition(ExclusiveCategory::new("disk"));
        let follower = flagged_task(&ran).with_condition(ExclusiveCategory::new("disk"));

        queue.add_tasks([broken.clone(), follower.clone()]);
        within(queue.wait_until_all_finished()).await;

        assert!(broken.is_finished());
        assert!(matches!(
            broken.errors().as_slice(),
            [TaskError::ExecutionFailed(message)] if message.contains("disk on fire")
        ));
        assert!(ran.load(Ordering::SeqCst));
        assert!(follower.errors().is_empty());
        assert!(queue.coordinator().categories().is_empty());
        assert_eq!(queue.task_count(), 0);
    }

    #[tokio::test]
    async fn test_panicking_condition_is_reported_as_unsatisfied() {
        let queue = queue();
        let ran = Arc::new(AtomicBool::new(false));
        let task = flagged_task(&ran).with_condition(BrittleCondition);

        queue.add_task(task.clone());
        within(queue.wait_until_all_finished()).await;

        assert!(!ran.load(Ordering::SeqCst));
        assert!(matches!(
            task.errors().as_slice(),
            [TaskError::ConditionNotSatisfied { condition, reason }]
                if condition == "Brittle" && reason.contains("lookup table missing")
        ));
    }

    #[tokio::test]
    async fn test_panicking_work_is_reported_to_delegate() {
        let queue = queue();
        let delegate = Arc::new(RecordingDelegate::default());
        queue.set_delegate(delegate.clone());

        let work = queue.add_work("compact", async {
            panic!("index corrupted");
        });
        within(queue.wait_until_all_finished()).await;

        assert_eq!(*delegate.finished.lock().unwrap(), vec![(work.id, 1)]);
    }
}
