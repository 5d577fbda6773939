/// Lifecycle of one cached byte range.
///
/// Absent → Fetching → Resident → (evicted) Absent. A failed fetch returns
/// to Absent so the next caller retries.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ResidencyState {
    Absent,
    Fetching,
    Resident,
}
