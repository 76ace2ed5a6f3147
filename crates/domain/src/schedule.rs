use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use cron::Schedule;

/// 调度表达式
///
/// 支持 6/7 段 cron（秒在前）、5 段标准 cron、`@hourly` 等预设、
/// `@once` 以及固定间隔 `every <n>{s|m|h|d}`。
#[derive(Debug, Clone)]
pub enum ScheduleExpression {
    Cron(Box<Schedule>),
    Interval(Duration),
    Once,
}

impl ScheduleExpression {
    pub fn parse(expr: &str) -> Result<Self, String> {
        let trimmed = expr.trim();
        let cron_expr = match trimmed {
            "" => return Err("调度表达式不能为空".to_string()),
            "@once" => return Ok(ScheduleExpression::Once),
            "@hourly" => "0 0 * * * *".to_string(),
            "@daily" | "@midnight" => "0 0 0 * * *".to_string(),
            "@weekly" => "0 0 0 * * Sun".to_string(),
            "@monthly" => "0 0 0 1 * *".to_string(),
            "@yearly" | "@annually" => "0 0 0 1 1 *".to_string(),
            s if s.starts_with("every ") => {
                return parse_interval(&s["every ".len()..]).map(ScheduleExpression::Interval)
            }
            s if s.split_whitespace().count() == 5 => format!("0 {s}"),
            s => s.to_string(),
        };
        Schedule::from_str(&cron_expr)
            .map(|s| ScheduleExpression::Cron(Box::new(s)))
            .map_err(|e| e.to_string())
    }
}

fn parse_interval(raw: &str) -> Result<Duration, String> {
    let raw = raw.trim();
    if raw.len() < 2 || !raw.is_ascii() {
        return Err(format!("无效的间隔: {raw}"));
    }
    let (num, unit) = raw.split_at(raw.len() - 1);
    let n: i64 = num
        .trim()
        .parse()
        .map_err(|_| format!("无效的间隔: {raw}"))?;
    if n <= 0 {
        return Err(format!("间隔必须大于0: {raw}"));
    }
    let step = match unit {
        "s" => Duration::try_seconds(n),
        "m" => Duration::try_minutes(n),
        "h" => Duration::try_hours(n),
        "d" => Duration::try_days(n),
        _ => return Err(format!("不支持的间隔单位: {unit}")),
    };
    step.ok_or_else(|| format!("间隔超出范围: {raw}"))
}

/// `base + step * n`，溢出时返回 `None`
fn offset_by_steps(base: DateTime<Utc>, step_secs: i64, n: i64) -> Option<DateTime<Utc>> {
    let secs = step_secs.checked_mul(n)?;
    base.checked_add_signed(Duration::try_seconds(secs)?)
}

/// 一个调度区间 `[start, end)`，`start` 即运行实例的逻辑日期
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataInterval {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

/// 绑定了起止日期的调度
///
/// 触发时间 f0 < f1 < ... 从 `start_date` 开始；区间 `[fi, fi+1)` 在
/// `fi+1 <= now` 时才算完整、可以创建运行实例。`end_date` 之后开始的区间不会产生。
#[derive(Debug, Clone)]
pub struct WorkflowSchedule {
    expression: ScheduleExpression,
    start_date: DateTime<Utc>,
    end_date: Option<DateTime<Utc>>,
}

impl WorkflowSchedule {
    pub fn new(
        expr: &str,
        start_date: DateTime<Utc>,
        end_date: Option<DateTime<Utc>>,
    ) -> Result<Self, String> {
        Ok(Self {
            expression: ScheduleExpression::parse(expr)?,
            start_date,
            end_date,
        })
    }

    pub fn expression(&self) -> &ScheduleExpression {
        &self.expression
    }

    pub fn start_date(&self) -> DateTime<Utc> {
        self.start_date
    }

    fn first_fire(&self) -> Option<DateTime<Utc>> {
        match &self.expression {
            ScheduleExpression::Cron(schedule) => schedule
                .after(&self.start_date.checked_sub_signed(Duration::seconds(1))?)
                .find(|t| *t >= self.start_date),
            ScheduleExpression::Interval(_) | ScheduleExpression::Once => Some(self.start_date),
        }
    }

    /// 严格晚于 `t` 的下一个触发时间
    pub fn next_fire_after(&self, t: DateTime<Utc>) -> Option<DateTime<Utc>> {
        if t < self.start_date {
            return self.first_fire();
        }
        match &self.expression {
            ScheduleExpression::Cron(schedule) => schedule.after(&t).next(),
            ScheduleExpression::Interval(step) => {
                let step_secs = step.num_seconds();
                let k = (t - self.start_date).num_seconds() / step_secs;
                offset_by_steps(self.start_date, step_secs, k.checked_add(1)?)
            }
            ScheduleExpression::Once => None,
        }
    }

    /// 完整区间的右边界上限：`now` 与 `end_date` 约束中较早者
    fn bound(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        match self.end_date.and_then(|end| self.next_fire_after(end)) {
            Some(limit) if limit < now => limit,
            _ => now,
        }
    }

    /// 右边界不晚于 `bound` 的最后一个完整区间
    fn latest_complete_interval(&self, bound: DateTime<Utc>) -> Option<DataInterval> {
        let first = self.first_fire()?;
        match &self.expression {
            ScheduleExpression::Interval(step) => {
                let step_secs = step.num_seconds();
                if bound < first {
                    return None;
                }
                let complete = (bound - first).num_seconds() / step_secs;
                if complete < 1 {
                    return None;
                }
                let start = offset_by_steps(first, step_secs, complete - 1)?;
                Some(DataInterval {
                    start,
                    end: offset_by_steps(start, step_secs, 1)?,
                })
            }
            ScheduleExpression::Cron(schedule) => {
                // 窗口无法再扩大时退化为从第一次触发开始
                let mut window = Some(Duration::hours(1));
                loop {
                    let from = window
                        .and_then(|w| bound.checked_sub_signed(w))
                        .map_or(first, |t| t.max(first));
                    let fires: Vec<DateTime<Utc>> = schedule
                        .after(&from.checked_sub_signed(Duration::seconds(1))?)
                        .skip_while(|t| *t < from)
                        .take_while(|t| *t <= bound)
                        .collect();
                    if fires.len() >= 2 {
                        let n = fires.len();
                        return Some(DataInterval {
                            start: fires[n - 2],
                            end: fires[n - 1],
                        });
                    }
                    if from == first {
                        return None;
                    }
                    window = window.and_then(|w| w.checked_mul(2));
                }
            }
            ScheduleExpression::Once => None,
        }
    }

    /// 计算应创建的区间
    ///
    /// - `last_logical`：已存在的最新运行实例的逻辑日期
    /// - `catchup == false`：只返回最近一个完整区间（若比已有的新）
    /// - `catchup == true`：返回所有缺失区间，从最旧开始，最多 `cap` 个
    pub fn due_intervals(
        &self,
        last_logical: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
        catchup: bool,
        cap: usize,
    ) -> Vec<DataInterval> {
        if cap == 0 {
            return Vec::new();
        }

        if let ScheduleExpression::Once = self.expression {
            let within_end = self.end_date.map_or(true, |end| self.start_date <= end);
            if last_logical.is_none() && self.start_date <= now && within_end {
                return vec![DataInterval {
                    start: self.start_date,
                    end: self.start_date,
                }];
            }
            return Vec::new();
        }

        let cursor = match last_logical {
            Some(last) => self.next_fire_after(last),
            None => self.first_fire(),
        };
        let Some(cursor) = cursor else {
            return Vec::new();
        };
        let bound = self.bound(now);

        if !catchup {
            return match self.latest_complete_interval(bound) {
                Some(interval) if interval.start >= cursor => vec![interval],
                _ => Vec::new(),
            };
        }

        let mut intervals = Vec::new();
        let mut start = cursor;
        while intervals.len() < cap {
            let Some(end) = self.next_fire_after(start) else {
                break;
            };
            if end > bound {
                break;
            }
            intervals.push(DataInterval { start, end });
            start = end;
        }
        intervals
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn day(d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, d, 0, 0, 0).unwrap()
    }

    #[test]
    fn test_parse_forms() {
        assert!(matches!(
            ScheduleExpression::parse("@daily").unwrap(),
            ScheduleExpression::Cron(_)
        ));
        assert!(matches!(
            ScheduleExpression::parse("0 2 * * *").unwrap(),
            ScheduleExpression::Cron(_)
        ));
        assert!(matches!(
            ScheduleExpression::parse("0 0 2 * * *").unwrap(),
            ScheduleExpression::Cron(_)
        ));
        assert!(matches!(
            ScheduleExpression::parse("@once").unwrap(),
            ScheduleExpression::Once
        ));
        match ScheduleExpression::parse("every 1d").unwrap() {
            ScheduleExpression::Interval(d) => assert_eq!(d, Duration::days(1)),
            other => panic!("unexpected {other:?}"),
        }
        assert!(ScheduleExpression::parse("every 0h").is_err());
        assert!(ScheduleExpression::parse("every 5w").is_err());
        assert!(ScheduleExpression::parse("not a cron").is_err());
        assert!(ScheduleExpression::parse("").is_err());
    }

    #[test]
    fn test_out_of_range_interval_is_rejected() {
        assert!(ScheduleExpression::parse("every 99999999999999d").is_err());
        assert!(ScheduleExpression::parse("every 9223372036854775807s").is_err());
        assert!(WorkflowSchedule::new("every 99999999999999h", day(1), None).is_err());
    }

    #[test]
    fn test_huge_interval_never_overflows() {
        // 一亿天的间隔：下一次触发超出日期范围，不产生区间
        let schedule = WorkflowSchedule::new("every 100000000d", day(1), None).unwrap();
        let now = day(20);
        assert!(schedule.next_fire_after(day(2)).is_none());
        assert!(schedule.due_intervals(None, now, true, 1000).is_empty());
        assert!(schedule.due_intervals(None, now, false, 1000).is_empty());
        assert!(schedule.due_intervals(Some(day(1)), now, true, 1000).is_empty());
    }

    #[test]
    fn test_catchup_false_creates_only_latest() {
        let schedule = WorkflowSchedule::new("@daily", day(1), None).unwrap();
        // 1月1日至1月11日共10个完整区间
        let now = day(11) + Duration::hours(3);
        let intervals = schedule.due_intervals(None, now, false, 1000);
        assert_eq!(
            intervals,
            vec![DataInterval {
                start: day(10),
                end: day(11)
            }]
        );
    }

    #[test]
    fn test_catchup_true_creates_all_oldest_first() {
        let schedule = WorkflowSchedule::new("every 1d", day(1), None).unwrap();
        let now = day(11) + Duration::hours(3);
        let intervals = schedule.due_intervals(None, now, true, 1000);
        assert_eq!(intervals.len(), 10);
        assert_eq!(intervals[0].start, day(1));
        assert_eq!(intervals[9].start, day(10));
        assert!(intervals.windows(2).all(|w| w[0].end == w[1].start));
    }

    #[test]
    fn test_catchup_resumes_after_last_run_and_respects_cap() {
        let schedule = WorkflowSchedule::new("@daily", day(1), None).unwrap();
        let now = day(11);
        let intervals = schedule.due_intervals(Some(day(3)), now, true, 4);
        let starts: Vec<_> = intervals.iter().map(|i| i.start).collect();
        assert_eq!(starts, vec![day(4), day(5), day(6), day(7)]);
    }

    #[test]
    fn test_no_interval_before_first_completes() {
        let schedule = WorkflowSchedule::new("@daily", day(1), None).unwrap();
        let now = day(1) + Duration::hours(23);
        assert!(schedule.due_intervals(None, now, true, 10).is_empty());
        assert!(schedule.due_intervals(None, now, false, 10).is_empty());
    }

    #[test]
    fn test_already_created_latest_is_not_repeated() {
        let schedule = WorkflowSchedule::new("every 1d", day(1), None).unwrap();
        let now = day(11) + Duration::hours(3);
        assert!(schedule
            .due_intervals(Some(day(10)), now, false, 10)
            .is_empty());
    }

    #[test]
    fn test_end_date_stops_intervals() {
        let schedule = WorkflowSchedule::new("@daily", day(1), Some(day(3))).unwrap();
        let now = day(20);
        let starts: Vec<_> = schedule
            .due_intervals(None, now, true, 100)
            .iter()
            .map(|i| i.start)
            .collect();
        assert_eq!(starts, vec![day(1), day(2), day(3)]);
        let latest = schedule.due_intervals(None, now, false, 100);
        assert_eq!(latest[0].start, day(3));
    }

    #[test]
    fn test_once_creates_single_run() {
        let schedule = WorkflowSchedule::new("@once", day(2), None).unwrap();
        assert!(schedule.due_intervals(None, day(1), true, 10).is_empty());
        let intervals = schedule.due_intervals(None, day(5), false, 10);
        assert_eq!(intervals.len(), 1);
        assert_eq!(intervals[0].start, day(2));
        assert!(schedule.due_intervals(Some(day(2)), day(5), true, 10).is_empty());
    }

    #[test]
    fn test_hourly_cron_latest_interval_far_from_start() {
        let schedule = WorkflowSchedule::new("@hourly", day(1), None).unwrap();
        let now = day(20) + Duration::minutes(30);
        let latest = schedule.due_intervals(None, now, false, 10);
        assert_eq!(latest.len(), 1);
        assert_eq!(latest[0].start, day(19) + Duration::hours(23));
        assert_eq!(latest[0].end, day(20));
    }
}
