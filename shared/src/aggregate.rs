use std::collections::{BTreeMap, BTreeSet};

use chrono::NaiveDate;

use crate::{AggregateError, CommitRecord, DailyCommitCount, OverallMetrics, UserTotals};

#[derive(Default)]
struct UserAccum {
    commits: u64,
    files_changed: u64,
    lines_added: u64,
    lines_removed: u64,
    commits_per_day: BTreeMap<NaiveDate, u64>,
}

fn counter(record: &CommitRecord, field: &'static str, value: i64) -> Result<u64, AggregateError> {
    u64::try_from(value).map_err(|_| AggregateError::InvalidRecord {
        sha: record.sha.clone(),
        field,
        value,
    })
}

/// Reduces commit records into per-user totals and per-day commit counts.
///
/// The input is treated as an unordered set. Users come out in lexicographic
/// order and daily rows are ordered by `(user, date)`, so identical input
/// always yields identical tables.
pub fn aggregate(
    commits: &[CommitRecord],
) -> Result<(Vec<UserTotals>, Vec<DailyCommitCount>), AggregateError> {
    let mut users: BTreeMap<&str, UserAccum> = BTreeMap::new();

    for record in commits {
        let files_changed = counter(record, "files_changed", record.files_changed)?;
        let lines_added = counter(record, "lines_added", record.lines_added)?;
        let lines_removed = counter(record, "lines_removed", record.lines_removed)?;

        let entry = users.entry(record.author.as_str()).or_default();
        entry.commits += 1;
        entry.files_changed += files_changed;
        entry.lines_added += lines_added;
        entry.lines_removed += lines_removed;
        *entry.commits_per_day.entry(record.date()).or_default() += 1;
    }

    let totals = users
        .iter()
        .map(|(user, accum)| UserTotals {
            user: user.to_string(),
            total_coding_days: accum.commits_per_day.len() as u64,
            total_commits: accum.commits,
            files_changed: accum.files_changed,
            lines_added: accum.lines_added,
            lines_removed: accum.lines_removed,
        })
        .collect();

    let daily = users
        .iter()
        .flat_map(|(user, accum)| {
            accum
                .commits_per_day
                .iter()
                .map(move |(date, count)| DailyCommitCount {
                    user: user.to_string(),
                    date: *date,
                    commit_count: *count,
                })
        })
        .collect();

    Ok((totals, daily))
}

/// Reduces the per-user tables into repository-wide metrics.
///
/// Coding days are the distinct dates across all users, so a day shared by
/// two users counts once.
pub fn overall(users: &[UserTotals], daily: &[DailyCommitCount]) -> OverallMetrics {
    let coding_days: BTreeSet<NaiveDate> = daily.iter().map(|row| row.date).collect();

    users.iter().fold(
        OverallMetrics {
            total_coding_days: coding_days.len() as u64,
            ..Default::default()
        },
        |mut acc, user| {
            acc.total_commits += user.total_commits;
            acc.files_changed += user.files_changed;
            acc.lines_added += user.lines_added;
            acc.lines_removed += user.lines_removed;
            acc
        },
    )
}

#[cfg(test)]
mod tests {
    use chrono::{DateTime, Utc};

    use super::*;

    fn at(date: &str, time: &str) -> DateTime<Utc> {
        format!("{date}T{time}Z").parse().unwrap()
    }

    fn commit(
        sha: &str,
        author: &str,
        timestamp: DateTime<Utc>,
        files: i64,
        added: i64,
        removed: i64,
    ) -> CommitRecord {
        CommitRecord {
            sha: sha.to_string(),
            author: author.to_string(),
            timestamp,
            files_changed: files,
            lines_added: added,
            lines_removed: removed,
        }
    }

    fn date(value: &str) -> NaiveDate {
        value.parse().unwrap()
    }

    fn sample_commits() -> Vec<CommitRecord> {
        vec![
            commit("a1", "A", at("2024-01-01", "09:00:00"), 1, 10, 2),
            commit("a2", "A", at("2024-01-01", "17:30:00"), 2, 5, 0),
            commit("b1", "B", at("2024-01-02", "12:00:00"), 1, 3, 1),
        ]
    }

    #[test]
    fn reduces_three_commits_into_both_tables() {
        let (users, daily) = aggregate(&sample_commits()).unwrap();

        assert_eq!(
            users,
            vec![
                UserTotals {
                    user: "A".to_string(),
                    total_coding_days: 1,
                    total_commits: 2,
                    files_changed: 3,
                    lines_added: 15,
                    lines_removed: 2,
                },
                UserTotals {
                    user: "B".to_string(),
                    total_coding_days: 1,
                    total_commits: 1,
                    files_changed: 1,
                    lines_added: 3,
                    lines_removed: 1,
                },
            ]
        );
        assert_eq!(
            daily,
            vec![
                DailyCommitCount {
                    user: "A".to_string(),
                    date: date("2024-01-01"),
                    commit_count: 2,
                },
                DailyCommitCount {
                    user: "B".to_string(),
                    date: date("2024-01-02"),
                    commit_count: 1,
                },
            ]
        );

        let overall = overall(&users, &daily);
        assert_eq!(
            overall,
            OverallMetrics {
                total_coding_days: 2,
                total_commits: 3,
                files_changed: 4,
                lines_added: 18,
                lines_removed: 3,
            }
        );
        assert_eq!(overall.net_lines_changed(), 15);
    }

    #[test]
    fn output_does_not_depend_on_input_order() {
        let mut commits = sample_commits();
        commits.push(commit("c1", "C", at("2024-01-03", "08:00:00"), 4, 40, 4));
        commits.push(commit("a3", "A", at("2024-01-03", "08:00:00"), 1, 1, 1));
        let expected = aggregate(&commits).unwrap();

        for shift in 1..commits.len() {
            let mut reordered = commits.clone();
            reordered.rotate_left(shift);
            assert_eq!(aggregate(&reordered).unwrap(), expected);
            reordered.reverse();
            assert_eq!(aggregate(&reordered).unwrap(), expected);
        }
    }

    #[test]
    fn coding_days_bounded_by_commits() {
        let commits = vec![
            commit("1", "A", at("2024-03-01", "10:00:00"), 1, 1, 0),
            commit("2", "A", at("2024-03-01", "11:00:00"), 1, 1, 0),
            commit("3", "A", at("2024-03-02", "11:00:00"), 1, 1, 0),
            commit("4", "B", at("2024-03-01", "10:00:00"), 1, 1, 0),
            commit("5", "B", at("2024-03-05", "10:00:00"), 1, 1, 0),
        ];
        let (users, daily) = aggregate(&commits).unwrap();

        let a = &users[0];
        assert_eq!((a.total_coding_days, a.total_commits), (2, 3));
        let b = &users[1];
        assert_eq!((b.total_coding_days, b.total_commits), (2, 2));

        for user in &users {
            assert!(user.total_coding_days <= user.total_commits);
            let per_day: u64 = daily
                .iter()
                .filter(|row| row.user == user.user)
                .map(|row| row.commit_count)
                .sum();
            assert_eq!(per_day, user.total_commits);
        }
    }

    #[test]
    fn shared_days_count_once_overall() {
        let commits = vec![
            commit("1", "A", at("2024-03-01", "10:00:00"), 2, 7, 3),
            commit("2", "B", at("2024-03-01", "12:00:00"), 3, 1, 9),
            commit("3", "B", at("2024-03-02", "12:00:00"), 1, 2, 2),
        ];
        let (users, daily) = aggregate(&commits).unwrap();
        let overall = overall(&users, &daily);

        let sum_days: u64 = users.iter().map(|u| u.total_coding_days).sum();
        assert_eq!(sum_days, 3);
        assert_eq!(overall.total_coding_days, 2);
        assert_eq!(overall.total_commits, users.iter().map(|u| u.total_commits).sum::<u64>());
        assert_eq!(overall.files_changed, 6);
        assert_eq!(overall.lines_added, 10);
        assert_eq!(overall.lines_removed, 14);
        assert_eq!(overall.net_lines_changed(), -4);
    }

    #[test]
    fn negative_counter_is_rejected() {
        let mut commits = sample_commits();
        commits[1].lines_added = -1;

        let err = aggregate(&commits).unwrap_err();
        assert_eq!(
            err,
            AggregateError::InvalidRecord {
                sha: "a2".to_string(),
                field: "lines_added",
                value: -1,
            }
        );
    }

    #[test]
    fn empty_input_gives_empty_tables() {
        let (users, daily) = aggregate(&[]).unwrap();
        assert!(users.is_empty());
        assert!(daily.is_empty());
        assert_eq!(overall(&users, &daily), OverallMetrics::default());
    }
}
