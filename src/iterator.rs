//! Bounded-memory scan over the points of one track.
//!
//! Points are fetched from a [`PointStore`] in pages of at most `page_size`
//! rows; only the current page is held in memory. Each new page starts just
//! past the last returned id, so a scan never repeats or skips a row even
//! when points are appended while it runs.

use std::vec;

use crate::database::{PointStore, ScanDirection};
use crate::error::{DatabaseError, PointIteratorError};
use crate::models::{TrackId, TrackPoint, TrackPointId};

/// Default number of rows fetched per page
pub const DEFAULT_PAGE_SIZE: usize = 2000;

pub struct PagedPointIterator<'a, S: PointStore + ?Sized> {
    store: &'a S,
    track_id: TrackId,
    start: Option<TrackPointId>,
    last_id: Option<TrackPointId>,
    direction: ScanDirection,
    page_size: usize,
    page: Option<vec::IntoIter<TrackPoint>>,
    exhausted: bool,
    closed: bool,
    pages_fetched: usize,
}

impl<'a, S: PointStore + ?Sized> PagedPointIterator<'a, S> {
    /// Scans `track_id` from `start` (inclusive) or from the first point in
    /// `direction` when `start` is `None`. A zero page size is treated as one.
    pub fn new(
        store: &'a S,
        track_id: TrackId,
        start: Option<TrackPointId>,
        direction: ScanDirection,
        page_size: usize,
    ) -> Self {
        Self {
            store,
            track_id,
            start,
            last_id: None,
            direction,
            page_size: page_size.max(1),
            page: None,
            exhausted: false,
            closed: false,
            pages_fetched: 0,
        }
    }

    /// All points of a track, oldest first, with the default page size
    pub fn ascending(store: &'a S, track_id: TrackId) -> Self {
        Self::new(store, track_id, None, ScanDirection::Ascending, DEFAULT_PAGE_SIZE)
    }

    /// True if another point is available, fetching the next page if needed.
    ///
    /// A closed iterator has no next point.
    pub fn has_next(&mut self) -> Result<bool, PointIteratorError> {
        if self.closed {
            return Ok(false);
        }
        loop {
            if self.page.as_ref().is_some_and(|page| page.len() > 0) {
                return Ok(true);
            }
            if self.exhausted {
                return Ok(false);
            }
            self.fetch_page()?;
        }
    }

    /// Returns the next point.
    ///
    /// Fails with [`PointIteratorError::Exhausted`] past the last point and
    /// with [`PointIteratorError::Closed`] after [`close`](Self::close).
    pub fn next_point(&mut self) -> Result<TrackPoint, PointIteratorError> {
        if self.closed {
            return Err(PointIteratorError::Closed);
        }
        if !self.has_next()? {
            return Err(PointIteratorError::Exhausted {
                last_id: self.last_id,
            });
        }
        match self.page.as_mut().and_then(Iterator::next) {
            Some(point) => {
                if point.id.is_some() {
                    self.last_id = point.id;
                }
                Ok(point)
            }
            None => Err(PointIteratorError::Exhausted {
                last_id: self.last_id,
            }),
        }
    }

    /// Releases the current page; safe to call repeatedly
    pub fn close(&mut self) {
        self.page = None;
        self.closed = true;
    }

    /// Allows another fetch after the end was reached, picking up points
    /// stored since the last returned one
    pub fn refresh(&mut self) {
        if !self.closed {
            self.exhausted = false;
        }
    }

    pub fn has_open_page(&self) -> bool {
        self.page.is_some()
    }

    pub fn pages_fetched(&self) -> usize {
        self.pages_fetched
    }

    /// Id of the last point returned
    pub fn last_id(&self) -> Option<TrackPointId> {
        self.last_id
    }

    fn next_start(&self) -> Option<TrackPointId> {
        match (self.last_id, self.direction) {
            (None, _) => self.start,
            (Some(id), ScanDirection::Ascending) => Some(TrackPointId(id.0.saturating_add(1))),
            (Some(id), ScanDirection::Descending) => Some(TrackPointId(id.0.saturating_sub(1))),
        }
    }

    fn fetch_page(&mut self) -> Result<(), DatabaseError> {
        let rows = self.store.query_track_points(
            self.track_id,
            self.next_start(),
            self.page_size,
            self.direction,
        )?;
        self.pages_fetched += 1;
        // a short page means the end of the track
        self.exhausted = rows.len() < self.page_size;
        tracing::trace!(
            track_id = %self.track_id,
            rows = rows.len(),
            page = self.pages_fetched,
            "Fetched track point page"
        );
        self.page = Some(rows.into_iter());
        Ok(())
    }
}

impl<S: PointStore + ?Sized> Iterator for PagedPointIterator<'_, S> {
    type Item = Result<TrackPoint, DatabaseError>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.next_point() {
            Ok(point) => Some(Ok(point)),
            Err(PointIteratorError::Store(err)) => Some(Err(err)),
            Err(PointIteratorError::Exhausted { .. }) | Err(PointIteratorError::Closed) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use std::cell::{Cell, RefCell};

    /// In-memory store counting the queries it serves
    struct VecStore {
        points: RefCell<Vec<TrackPoint>>,
        queries: Cell<usize>,
    }

    impl VecStore {
        fn with_points(count: i64) -> Self {
            let store = Self {
                points: RefCell::new(Vec::new()),
                queries: Cell::new(0),
            };
            for _ in 0..count {
                store.push();
            }
            store
        }

        fn push(&self) {
            let mut points = self.points.borrow_mut();
            let id = points.len() as i64 + 1;
            let mut point = TrackPoint::sample(Utc.timestamp_opt(id, 0).unwrap());
            point.id = Some(TrackPointId(id));
            points.push(point);
        }
    }

    impl PointStore for VecStore {
        fn query_track_points(
            &self,
            _track_id: TrackId,
            start: Option<TrackPointId>,
            max_rows: usize,
            direction: ScanDirection,
        ) -> Result<Vec<TrackPoint>, DatabaseError> {
            self.queries.set(self.queries.get() + 1);
            let points = self.points.borrow();
            let rows: Vec<TrackPoint> = match direction {
                ScanDirection::Ascending => points
                    .iter()
                    .filter(|p| start.map_or(true, |s| p.id.unwrap() >= s))
                    .take(max_rows)
                    .cloned()
                    .collect(),
                ScanDirection::Descending => points
                    .iter()
                    .rev()
                    .filter(|p| start.map_or(true, |s| p.id.unwrap() <= s))
                    .take(max_rows)
                    .cloned()
                    .collect(),
            };
            Ok(rows)
        }
    }

    struct FailingStore;

    impl PointStore for FailingStore {
        fn query_track_points(
            &self,
            _track_id: TrackId,
            _start: Option<TrackPointId>,
            _max_rows: usize,
            _direction: ScanDirection,
        ) -> Result<Vec<TrackPoint>, DatabaseError> {
            Err(DatabaseError::InvalidData {
                column: "time".to_string(),
                reason: "disk unplugged".to_string(),
            })
        }
    }

    fn ids(points: &[TrackPoint]) -> Vec<i64> {
        points.iter().map(|p| p.id.unwrap().0).collect()
    }

    #[test]
    fn test_pages_through_all_rows() {
        let page_size = 3;
        let store = VecStore::with_points(2 * page_size as i64 + 1);
        let mut iter =
            PagedPointIterator::new(&store, TrackId(1), None, ScanDirection::Ascending, page_size);

        let mut seen = Vec::new();
        while iter.has_next().unwrap() {
            seen.push(iter.next_point().unwrap());
        }

        assert_eq!(ids(&seen), vec![1, 2, 3, 4, 5, 6, 7]);
        assert!(iter.pages_fetched() >= 3);
        assert_eq!(store.queries.get(), iter.pages_fetched());
        assert!(matches!(
            iter.next_point(),
            Err(PointIteratorError::Exhausted {
                last_id: Some(TrackPointId(7))
            })
        ));

        iter.close();
        assert!(!iter.has_open_page());
    }

    #[test]
    fn test_exact_multiple_needs_trailing_empty_page() {
        let store = VecStore::with_points(6);
        let iter = PagedPointIterator::new(&store, TrackId(1), None, ScanDirection::Ascending, 3);
        let points: Vec<TrackPoint> = iter.collect::<Result<_, _>>().unwrap();
        assert_eq!(points.len(), 6);
        assert_eq!(store.queries.get(), 3);
    }

    #[test]
    fn test_descending_from_start_id() {
        let store = VecStore::with_points(10);
        let iter = PagedPointIterator::new(
            &store,
            TrackId(1),
            Some(TrackPointId(8)),
            ScanDirection::Descending,
            4,
        );
        let points: Vec<TrackPoint> = iter.collect::<Result<_, _>>().unwrap();
        assert_eq!(ids(&points), vec![8, 7, 6, 5, 4, 3, 2, 1]);
    }

    #[test]
    fn test_close_mid_scan() {
        let store = VecStore::with_points(10);
        let mut iter = PagedPointIterator::new(&store, TrackId(1), None, ScanDirection::Ascending, 4);
        iter.next_point().unwrap();
        assert!(iter.has_open_page());

        iter.close();
        iter.close();

        assert!(!iter.has_open_page());
        assert!(!iter.has_next().unwrap());
        assert!(matches!(iter.next_point(), Err(PointIteratorError::Closed)));
        assert!(iter.next().is_none());
        assert_eq!(store.queries.get(), 1);
    }

    #[test]
    fn test_empty_track() {
        let store = VecStore::with_points(0);
        let mut iter = PagedPointIterator::ascending(&store, TrackId(1));
        assert!(!iter.has_next().unwrap());
        assert!(matches!(
            iter.next_point(),
            Err(PointIteratorError::Exhausted { last_id: None })
        ));
    }

    #[test]
    fn test_store_failure_is_not_exhaustion() {
        let mut iter = PagedPointIterator::ascending(&FailingStore, TrackId(1));
        assert!(matches!(iter.next_point(), Err(PointIteratorError::Store(_))));
        assert!(matches!(iter.next(), Some(Err(DatabaseError::InvalidData { .. }))));
    }

    #[test]
    fn test_refresh_picks_up_appended_points() {
        let store = VecStore::with_points(2);
        let mut iter = PagedPointIterator::new(&store, TrackId(1), None, ScanDirection::Ascending, 5);
        assert_eq!(iter.by_ref().count(), 2);

        store.push();
        store.push();
        assert!(!iter.has_next().unwrap());

        iter.refresh();
        let rest: Vec<TrackPoint> = iter.by_ref().collect::<Result<_, _>>().unwrap();
        assert_eq!(ids(&rest), vec![3, 4]);
        assert_eq!(iter.last_id(), Some(TrackPointId(4)));
    }

    #[test]
    fn test_works_through_trait_object() {
        let store = VecStore::with_points(3);
        let dyn_store: &dyn PointStore = &store;
        let iter = PagedPointIterator::new(dyn_store, TrackId(1), None, ScanDirection::Ascending, 2);
        assert_eq!(iter.count(), 3);
    }
}
