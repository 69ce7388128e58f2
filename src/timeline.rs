//! Time series of per-page state aggregated over the revisions of a dump.
//!
//! A [`Timeline`] is a fixed series of instants. A [`TimelineCollector`] reduces each revision
//! to a value and adds, for every instant, the value of the latest revision of every page that
//! predates it. Pages that do not exist yet at an instant contribute nothing.

use std::fmt;

use chrono::{DateTime, Duration, Months, Utc};

use crate::revision::{format_timestamp, Revision};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TimelineError {
    #[error("timeline end {end} is not after its start {start}")]
    EmptyRange {
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    },
    #[error("timeline period must be positive")]
    NonPositivePeriod,
}

/// Spacing between two consecutive instants of a timeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Period {
    Days(u32),
    Months(u32),
}

impl Period {
    fn is_positive(self) -> bool {
        match self {
            Period::Days(n) | Period::Months(n) => n > 0,
        }
    }

    /// `start` moved forward by `steps` periods, `None` past the representable date range.
    /// Computed from `start` each time so that month lengths do not accumulate drift.
    fn nth_after(self, start: DateTime<Utc>, steps: u32) -> Option<DateTime<Utc>> {
        match self {
            Period::Days(n) => {
                let days = i64::from(n).checked_mul(i64::from(steps))?;
                start.checked_add_signed(Duration::try_days(days)?)
            }
            Period::Months(n) => start.checked_add_months(Months::new(n.checked_mul(steps)?)),
        }
    }
}

/// A value that can be summed across pages.
pub trait Aggregate: Clone + Default {
    fn combine(&mut self, other: &Self);
}

impl Aggregate for u64 {
    fn combine(&mut self, other: &Self) {
        *self += other;
    }
}

impl Aggregate for i64 {
    fn combine(&mut self, other: &Self) {
        *self += other;
    }
}

/// A closed set of labels whose occurrences are counted by [`CategoryCounts`].
pub trait Category: Copy + 'static {
    /// Every category, in display order.
    const ALL: &'static [Self];

    /// Position of `self` in [`Category::ALL`].
    fn index(self) -> usize;

    fn label(self) -> &'static str;
}

/// One counter per category.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct CategoryCounts<E: Category> {
    counts: Vec<u64>,
    _category: std::marker::PhantomData<E>,
}

impl<E: Category> CategoryCounts<E> {
    pub fn new() -> Self {
        Self {
            counts: vec![0; E::ALL.len()],
            _category: std::marker::PhantomData,
        }
    }

    pub fn get(&self, category: E) -> u64 {
        self.counts[category.index()]
    }

    pub fn increment(&mut self, category: E) {
        self.add(category, 1);
    }

    pub fn add(&mut self, category: E, value: u64) {
        self.counts[category.index()] += value;
    }

    pub fn total(&self) -> u64 {
        self.counts.iter().sum()
    }

    pub fn clear(&mut self) {
        self.counts.fill(0);
    }
}

impl<E: Category> Default for CategoryCounts<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: Category> Aggregate for CategoryCounts<E> {
    fn combine(&mut self, other: &Self) {
        for (count, other) in self.counts.iter_mut().zip(&other.counts) {
            *count += other;
        }
    }
}

impl<E: Category> fmt::Display for CategoryCounts<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[")?;
        for (i, (category, count)) in E::ALL.iter().zip(&self.counts).enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{}={}", category.label(), count)?;
        }
        f.write_str("]")
    }
}

impl<E: Category> fmt::Debug for CategoryCounts<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry<T> {
    pub time: DateTime<Utc>,
    pub value: T,
}

/// Instants `start + i * period` for every `i` such that the instant is not after `end`, each
/// paired with an aggregated value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Timeline<T> {
    entries: Vec<Entry<T>>,
}

impl<T: Default> Timeline<T> {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>, period: Period) -> Result<Self, TimelineError> {
        if !period.is_positive() {
            return Err(TimelineError::NonPositivePeriod);
        }
        if end <= start {
            return Err(TimelineError::EmptyRange { start, end });
        }

        let mut entries = vec![Entry {
            time: start,
            value: T::default(),
        }];
        for step in 1.. {
            // an instant past the representable range is past `end` as well
            let Some(time) = period.nth_after(start, step).filter(|time| *time <= end) else {
                break;
            };
            entries.push(Entry {
                time,
                value: T::default(),
            });
        }
        Ok(Self { entries })
    }
}

impl<T> Timeline<T> {
    pub fn entries(&self) -> &[Entry<T>] {
        &self.entries
    }

    pub fn into_entries(self) -> Vec<Entry<T>> {
        self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Entry<T>> {
        self.entries.iter()
    }

    pub fn values(&self) -> impl Iterator<Item = &T> {
        self.entries.iter().map(|entry| &entry.value)
    }

    /// Index of the first instant strictly after `timestamp`, or `len()` if there is none.
    pub fn first_after(&self, timestamp: DateTime<Utc>) -> usize {
        self.entries.partition_point(|entry| entry.time <= timestamp)
    }
}

impl<'a, T> IntoIterator for &'a Timeline<T> {
    type Item = &'a Entry<T>;
    type IntoIter = std::slice::Iter<'a, Entry<T>>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

impl<T: fmt::Display> fmt::Display for Timeline<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, entry) in self.entries.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "[{},{}]", format_timestamp(&entry.time), entry.value)?;
        }
        Ok(())
    }
}

fn apply<T: Aggregate>(entries: &mut [Entry<T>], value: &T) {
    for entry in entries {
        entry.value.combine(value);
    }
}

#[derive(Debug)]
struct Cursor<T> {
    page_id: u64,
    /// first instant not yet given a value of this page
    next: usize,
    /// value of the latest revision seen for this page
    pending: T,
}

/// Folds revisions in canonical order (page, then revision) into a [`Timeline`].
///
/// The value of a revision holds for every instant after its timestamp, up to and including
/// the timestamp of the next revision of the same page. The latest revision of a page holds
/// until the end of the timeline.
pub struct TimelineCollector<T, F> {
    timeline: Timeline<T>,
    reducer: F,
    cursor: Option<Cursor<T>>,
    pages: u64,
}

impl<T, F> fmt::Debug for TimelineCollector<T, F>
where
    T: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimelineCollector")
            .field("timeline", &self.timeline)
            .field("cursor", &self.cursor)
            .field("pages", &self.pages)
            .finish_non_exhaustive()
    }
}

impl<T, F> TimelineCollector<T, F>
where
    T: Aggregate,
    F: FnMut(&Revision) -> T,
{
    pub fn new(timeline: Timeline<T>, reducer: F) -> Self {
        Self {
            timeline,
            reducer,
            cursor: None,
            pages: 0,
        }
    }

    pub fn accept(&mut self, revision: &Revision) {
        let upto = self.timeline.first_after(revision.timestamp);
        let value = (self.reducer)(revision);

        if let Some(cursor) = self
            .cursor
            .as_mut()
            .filter(|cursor| cursor.page_id == revision.page_id)
        {
            if upto > cursor.next {
                apply(&mut self.timeline.entries[cursor.next..upto], &cursor.pending);
                cursor.next = upto;
            }
            cursor.pending = value;
            return;
        }

        if let Some(previous) = self.cursor.take() {
            if revision.page_id < previous.page_id {
                tracing::warn!(
                    message = "Revisions are not in canonical order",
                    page_id = revision.page_id,
                    previous_page_id = previous.page_id
                );
            }
            self.flush(previous);
        }
        self.pages += 1;
        self.cursor = Some(Cursor {
            page_id: revision.page_id,
            next: upto,
            pending: value,
        });
    }

    /// Number of distinct pages accepted so far.
    pub fn pages(&self) -> u64 {
        self.pages
    }

    /// Feed every revision of a fallible stream, stopping at the first error.
    pub fn consume<I, E>(mut self, revisions: I) -> Result<Timeline<T>, E>
    where
        I: IntoIterator<Item = Result<Revision, E>>,
    {
        for revision in revisions {
            self.accept(&revision?);
        }
        Ok(self.finish())
    }

    pub fn finish(mut self) -> Timeline<T> {
        if let Some(cursor) = self.cursor.take() {
            self.flush(cursor);
        }
        tracing::debug!(
            message = "Timeline complete",
            pages = self.pages,
            instants = self.timeline.len()
        );
        self.timeline
    }

    fn flush(&mut self, cursor: Cursor<T>) {
        apply(&mut self.timeline.entries[cursor.next..], &cursor.pending);
    }
}

/// Sum a numeric measure of the latest revision of every page.
pub fn mapping<F>(timeline: Timeline<u64>, measure: F) -> TimelineCollector<u64, F>
where
    F: FnMut(&Revision) -> u64,
{
    TimelineCollector::new(timeline, measure)
}

/// Count the pages whose latest revision satisfies `predicate`.
pub fn counting<P>(
    timeline: Timeline<u64>,
    mut predicate: P,
) -> TimelineCollector<u64, impl FnMut(&Revision) -> u64>
where
    P: FnMut(&Revision) -> bool,
{
    TimelineCollector::new(timeline, move |revision: &Revision| u64::from(predicate(revision)))
}

/// Count the pages per category of their latest revision. `classify` records the categories
/// of one revision into an empty counter.
pub fn categorical<E, C>(
    timeline: Timeline<CategoryCounts<E>>,
    mut classify: C,
) -> TimelineCollector<CategoryCounts<E>, impl FnMut(&Revision) -> CategoryCounts<E>>
where
    E: Category,
    C: FnMut(&Revision, &mut CategoryCounts<E>),
{
    TimelineCollector::new(timeline, move |revision: &Revision| {
        let mut counts = CategoryCounts::new();
        classify(revision, &mut counts);
        counts
    })
}

#[cfg(test)]
mod tests {
    use std::convert::Infallible;

    use chrono::TimeZone;
    use proptest::prelude::*;

    use super::*;
    use crate::test_support::{dummy_revision, proptest::page_revisions};

    fn at(year: i32, month: u32, day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(year, month, day, 0, 0, 0).unwrap()
    }

    fn rev(page_id: u64, id: u64, timestamp: DateTime<Utc>, text: &str) -> Revision {
        Revision {
            page_id,
            id,
            timestamp,
            text: Some(text.to_owned()),
            ..dummy_revision()
        }
    }

    fn text_len(revision: &Revision) -> u64 {
        revision.text.as_deref().map_or(0, |t| t.len() as u64)
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Kind {
        Article,
        Redirect,
    }

    impl Category for Kind {
        const ALL: &'static [Self] = &[Kind::Article, Kind::Redirect];

        fn index(self) -> usize {
            self as usize
        }

        fn label(self) -> &'static str {
            match self {
                Kind::Article => "ARTICLE",
                Kind::Redirect => "REDIRECT",
            }
        }
    }

    #[test]
    fn builds_instants_up_to_end() {
        let timeline = Timeline::<u64>::new(at(2024, 1, 1), at(2024, 1, 10), Period::Days(3)).unwrap();
        let times: Vec<_> = timeline.iter().map(|e| e.time).collect();
        assert_eq!(
            times,
            vec![at(2024, 1, 1), at(2024, 1, 4), at(2024, 1, 7), at(2024, 1, 10)]
        );

        let timeline = Timeline::<u64>::new(at(2024, 1, 31), at(2024, 5, 1), Period::Months(1)).unwrap();
        let times: Vec<_> = timeline.iter().map(|e| e.time).collect();
        assert_eq!(
            times,
            vec![at(2024, 1, 31), at(2024, 2, 29), at(2024, 3, 31), at(2024, 4, 30)]
        );
    }

    #[test]
    fn rejects_invalid_ranges() {
        assert_eq!(
            Timeline::<u64>::new(at(2024, 1, 1), at(2024, 1, 1), Period::Days(1)),
            Err(TimelineError::EmptyRange {
                start: at(2024, 1, 1),
                end: at(2024, 1, 1)
            })
        );
        assert_eq!(
            Timeline::<u64>::new(at(2024, 1, 1), at(2024, 2, 1), Period::Months(0)),
            Err(TimelineError::NonPositivePeriod)
        );
    }

    #[test]
    fn period_beyond_date_range_gives_single_instant() {
        for period in [Period::Days(u32::MAX), Period::Months(u32::MAX)] {
            let timeline = Timeline::<u64>::new(at(2024, 1, 1), at(2025, 1, 1), period).unwrap();
            let times: Vec<_> = timeline.iter().map(|entry| entry.time).collect();
            assert_eq!(times, vec![at(2024, 1, 1)], "{period:?}");
        }
    }

    #[test]
    fn carries_values_forward() {
        let t0 = at(2024, 1, 1);
        let eps = Duration::seconds(1);
        let timeline = Timeline::new(t0, at(2024, 1, 3), Period::Days(1)).unwrap();

        let mut collector = mapping(timeline, |r: &Revision| r.id);
        collector.accept(&rev(1, 1, t0 - eps, ""));
        collector.accept(&rev(2, 2, at(2024, 1, 2) + eps, ""));
        let timeline = collector.finish();

        assert_eq!(timeline.values().copied().collect::<Vec<_>>(), vec![1, 1, 3]);
    }

    #[test]
    fn later_revision_replaces_earlier_one() {
        let timeline = Timeline::new(at(2024, 1, 1), at(2024, 1, 5), Period::Days(1)).unwrap();
        let revisions = [
            rev(1, 1, at(2023, 12, 31), "aaaa"),
            rev(1, 2, at(2024, 1, 2), "aa"),
            rev(1, 3, at(2024, 1, 3) + Duration::hours(5), "aaaaaa"),
            rev(2, 4, at(2024, 1, 4) - Duration::hours(1), "a"),
        ];
        let timeline = mapping(timeline, text_len)
            .consume(revisions.into_iter().map(Ok::<_, Infallible>))
            .unwrap();

        // a revision at exactly an instant only shows from the next instant on
        assert_eq!(
            timeline.values().copied().collect::<Vec<_>>(),
            vec![4, 4, 2, 7, 7]
        );
    }

    #[test]
    fn counts_matching_pages() {
        let timeline = Timeline::new(at(2024, 1, 1), at(2024, 1, 3), Period::Days(1)).unwrap();
        let mut collector = counting(timeline, |r: &Revision| {
            r.text.as_deref().is_some_and(|t| t.contains("{{stub}}"))
        });
        collector.accept(&rev(1, 1, at(2023, 6, 1), "{{stub}}"));
        collector.accept(&rev(1, 2, at(2024, 1, 2) + Duration::hours(1), "expanded"));
        collector.accept(&rev(2, 3, at(2023, 6, 1), "plain"));
        collector.accept(&rev(3, 4, at(2024, 1, 1) + Duration::hours(1), "{{stub}}"));
        assert_eq!(collector.pages(), 3);

        let timeline = collector.finish();
        assert_eq!(timeline.values().copied().collect::<Vec<_>>(), vec![1, 2, 1]);
    }

    #[test]
    fn counts_categories() {
        let timeline =
            Timeline::<CategoryCounts<Kind>>::new(at(2024, 1, 1), at(2024, 1, 2), Period::Days(1)).unwrap();
        let mut collector = categorical(timeline, |r: &Revision, counts| {
            counts.increment(if r.redirect { Kind::Redirect } else { Kind::Article });
        });
        collector.accept(&rev(1, 1, at(2023, 1, 1), ""));
        collector.accept(&Revision {
            redirect: true,
            ..rev(2, 2, at(2023, 1, 1), "")
        });
        collector.accept(&rev(3, 3, at(2024, 1, 1) + Duration::hours(1), ""));
        let timeline = collector.finish();

        let last = &timeline.entries()[1].value;
        assert_eq!(last.get(Kind::Article), 2);
        assert_eq!(last.get(Kind::Redirect), 1);
        assert_eq!(last.total(), 3);
        assert_eq!(timeline.entries()[0].value.to_string(), "[ARTICLE=1, REDIRECT=1]");
    }

    #[test]
    fn stops_at_first_error() {
        let timeline = Timeline::<u64>::new(at(2024, 1, 1), at(2024, 1, 2), Period::Days(1)).unwrap();
        let revisions = vec![Ok(rev(1, 1, at(2023, 1, 1), "")), Err("broken")];
        let result = mapping(timeline, |_: &Revision| 1).consume(revisions);
        assert_eq!(result, Err("broken"));
    }

    #[test]
    fn displays_entries() {
        let mut timeline = Timeline::<u64>::new(at(2024, 1, 1), at(2024, 1, 2), Period::Days(1)).unwrap();
        timeline.entries[1].value = 5;
        assert_eq!(
            timeline.to_string(),
            "[2024-01-01T00:00:00Z,0], [2024-01-02T00:00:00Z,5]"
        );
    }

    /// Value at every instant computed directly from the definition.
    fn oracle(timeline: &Timeline<u64>, revisions: &[Revision]) -> Vec<u64> {
        timeline
            .iter()
            .map(|entry| {
                revisions
                    .chunk_by(|a, b| a.page_id == b.page_id)
                    .filter_map(|page| page.iter().filter(|r| r.timestamp < entry.time).last())
                    .map(text_len)
                    .sum()
            })
            .collect()
    }

    proptest! {
        #[test]
        fn matches_direct_computation(revisions in page_revisions(12), days in 50u32..800) {
            let start = DateTime::from_timestamp(0, 0).unwrap();
            let end = DateTime::from_timestamp(2_100_000_000, 0).unwrap();
            let timeline = Timeline::new(start, end, Period::Days(days)).unwrap();
            let expected = oracle(&timeline, &revisions);

            let mut collector = mapping(timeline, text_len);
            for revision in &revisions {
                collector.accept(revision);
            }
            let actual: Vec<_> = collector.finish().values().copied().collect();
            prop_assert_eq!(actual, expected);
        }
    }
}
