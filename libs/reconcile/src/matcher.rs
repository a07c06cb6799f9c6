//! Label matching between jobs and queues.

use fleet_events::QueueConfig;

/// Decides whether a queue advertising `queue_label_sets` can run a job
/// requesting `requested_labels`.
///
/// Comparison is case-insensitive.
///
/// - `exact_match`: some label set must contain every requested label. The
///   queue may advertise more than requested, never less.
/// - otherwise: some label set must share at least one label with the job.
///
/// A job requesting no labels gets the negation of the above. For exact
/// queues with non-empty label sets that means "rejected"; for non-exact
/// queues with non-empty label sets it means "accepted". This is kept as-is
/// because deployed queue configurations rely on it.
pub fn can_run_job(
    requested_labels: &[String],
    queue_label_sets: &[Vec<String>],
    exact_match: bool,
) -> bool {
    let requested: Vec<String> = requested_labels.iter().map(|l| l.to_lowercase()).collect();
    let label_sets: Vec<Vec<String>> = queue_label_sets
        .iter()
        .map(|set| set.iter().map(|l| l.to_lowercase()).collect())
        .collect();

    let matched = if exact_match {
        label_sets
            .iter()
            .any(|set| requested.iter().all(|label| set.contains(label)))
    } else {
        label_sets
            .iter()
            .any(|set| requested.iter().any(|label| set.contains(label)))
    };

    if requested.is_empty() {
        !matched
    } else {
        matched
    }
}

/// Orders queues so exact-match queues are evaluated first.
///
/// Stable: the relative configuration order is otherwise preserved.
pub fn order_queues(mut queues: Vec<QueueConfig>) -> Vec<QueueConfig> {
    queues.sort_by_key(|q| !q.matcher_config.exact_match);
    queues
}

/// Returns the first queue (in the given order) able to run the job.
pub fn select_queue<'a>(
    ordered_queues: &'a [QueueConfig],
    requested_labels: &[String],
) -> Option<&'a QueueConfig> {
    ordered_queues.iter().find(|queue| {
        can_run_job(
            requested_labels,
            &queue.matcher_config.label_matchers,
            queue.matcher_config.exact_match,
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_events::MatcherConfig;
    use rstest::rstest;

    fn labels(values: &[&str]) -> Vec<String> {
        values.iter().map(|s| s.to_string()).collect()
    }

    fn queue(id: &str, sets: &[&[&str]], exact_match: bool) -> QueueConfig {
        QueueConfig {
            id: id.to_string(),
            arn: String::new(),
            fifo: false,
            matcher_config: MatcherConfig {
                label_matchers: sets.iter().map(|s| labels(s)).collect(),
                exact_match,
            },
        }
    }

    #[rstest]
    #[case::exact_subset(&["self-hosted", "linux"], true, true)]
    #[case::exact_equal(&["self-hosted", "linux", "x64"], true, true)]
    #[case::exact_case_insensitive(&["Self-Hosted", "LINUX"], true, true)]
    #[case::exact_extra_label(&["self-hosted", "linux", "x64", "on-demand"], true, false)]
    #[case::exact_empty_inverted(&[], true, false)]
    #[case::loose_overlap(&["linux", "gpu"], false, true)]
    #[case::loose_disjoint(&["windows"], false, false)]
    #[case::loose_empty_inverted(&[], false, true)]
    fn test_can_run_job(
        #[case] requested: &[&str],
        #[case] exact_match: bool,
        #[case] expected: bool,
    ) {
        let sets = vec![labels(&["self-hosted", "linux", "x64"])];
        assert_eq!(can_run_job(&labels(requested), &sets, exact_match), expected);
    }

    #[test]
    fn test_any_label_set_may_match() {
        let sets = vec![labels(&["self-hosted", "arm64"]), labels(&["self-hosted", "x64"])];
        assert!(can_run_job(&labels(&["self-hosted", "x64"]), &sets, true));
    }

    #[test]
    fn test_empty_labels_with_no_matchers() {
        // Neither mode matches anything, so the inversion accepts.
        assert!(can_run_job(&[], &[], true));
        assert!(can_run_job(&[], &[], false));
    }

    #[test]
    fn test_exact_queues_evaluated_first() {
        let queues = order_queues(vec![
            queue("loose-a", &[&["linux"]], false),
            queue("exact-a", &[&["self-hosted", "linux"]], true),
            queue("loose-b", &[&["gpu"]], false),
            queue("exact-b", &[&["self-hosted", "linux", "gpu"]], true),
        ]);

        let ids: Vec<_> = queues.iter().map(|q| q.id.as_str()).collect();
        assert_eq!(ids, vec!["exact-a", "exact-b", "loose-a", "loose-b"]);

        let selected = select_queue(&queues, &labels(&["self-hosted", "linux"])).unwrap();
        assert_eq!(selected.id, "exact-a");

        let selected = select_queue(&queues, &labels(&["gpu"])).unwrap();
        assert_eq!(selected.id, "loose-b");
    }

    #[test]
    fn test_no_queue_selected() {
        let queues = order_queues(vec![queue("exact", &[&["self-hosted", "x64", "linux"]], true)]);
        let requested = labels(&["self-hosted", "linux", "x64", "on-demand"]);
        assert!(select_queue(&queues, &requested).is_none());
    }
}
