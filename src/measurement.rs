//! Hierarchical measurement log.
//!
//! Every kernel invocation contributes a [`DataPoint`] carrying the device
//! events it produced; composite invocations (the fused adapter, merge
//! strategies) nest children under their parent. After a run completes,
//! [`Measurement::finalize`] resolves each event into profiling start/end
//! timestamps; a data point's span aggregates its own events and those of
//! its children.

use ocl::enums::ProfilingInfo;
use ocl::Event;

use crate::error::Result;

/// One named measurement node.
#[derive(Debug, Default)]
pub struct DataPoint {
    name: String,
    iteration: Option<u32>,
    events: Vec<Event>,
    // Resolved (start, end) pairs in device nanoseconds.
    timings: Vec<(u64, u64)>,
    // Host-measured values (e.g. the total wall time) in nanoseconds.
    values: Vec<u64>,
    children: Vec<DataPoint>,
}

impl DataPoint {
    pub fn new<S: Into<String>>(name: S) -> DataPoint {
        DataPoint { name: name.into(), ..DataPoint::default() }
    }

    pub fn with_iteration<S: Into<String>>(name: S, iteration: u32) -> DataPoint {
        DataPoint { name: name.into(), iteration: Some(iteration), ..DataPoint::default() }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn iteration(&self) -> Option<u32> {
        self.iteration
    }

    /// Attaches a device event whose profiling timestamps feed this node.
    pub fn add_event(&mut self, event: Event) {
        self.events.push(event);
    }

    /// Records a host-measured duration in nanoseconds.
    pub fn add_value(&mut self, nanoseconds: u64) {
        self.values.push(nanoseconds);
    }

    /// Adds and returns a nested data point.
    pub fn create_child<S: Into<String>>(&mut self, name: S) -> &mut DataPoint {
        let iteration = self.iteration;
        self.children.push(DataPoint { name: name.into(), iteration, ..DataPoint::default() });
        self.children.last_mut().unwrap()
    }

    /// The aggregate `(start, end, busy)` span over this node's timings and
    /// those of its children: earliest start, latest end, summed durations.
    pub fn span(&self) -> Option<(u64, u64, u64)> {
        let mut span: Option<(u64, u64, u64)> = None;
        let own = self.timings.iter().map(|&(s, e)| (s, e, e.saturating_sub(s)));
        let nested = self.children.iter().filter_map(|c| c.span());
        for (start, end, busy) in own.chain(nested) {
            span = Some(match span {
                None => (start, end, busy),
                Some((s, e, b)) => (s.min(start), e.max(end), b + busy),
            });
        }
        span
    }

    /// Total host-measured nanoseconds recorded on this node.
    pub fn value_sum(&self) -> u64 {
        self.values.iter().sum()
    }

    pub fn children(&self) -> &[DataPoint] {
        &self.children
    }

    fn finalize(&mut self) -> Result<()> {
        for event in self.events.drain(..) {
            let start = profiling_ns(&event, ProfilingInfo::Start)?;
            let end = profiling_ns(&event, ProfilingInfo::End)?;
            self.timings.push((start, end));
        }
        for child in &mut self.children {
            child.finalize()?;
        }
        Ok(())
    }
}

fn profiling_ns(event: &Event, info: ProfilingInfo) -> Result<u64> {
    let ns = event.profiling_info(info)?.time().map_err(ocl::Error::from)?;
    Ok(ns)
}

/// The measurement log of one benchmark run.
#[derive(Debug, Default)]
pub struct Measurement {
    run: u32,
    parameters: Vec<(String, String)>,
    datapoints: Vec<DataPoint>,
}

/// One flattened CSV record.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub name: String,
    pub run: u32,
    pub iteration: Option<u32>,
    pub start_ns: u64,
    pub end_ns: u64,
    pub duration_ns: u64,
}

impl Measurement {
    pub fn new(run: u32) -> Measurement {
        Measurement { run, ..Measurement::default() }
    }

    pub fn run(&self) -> u32 {
        self.run
    }

    pub fn set_parameter<K: Into<String>, V: Into<String>>(&mut self, key: K, value: V) {
        self.parameters.push((key.into(), value.into()));
    }

    pub fn parameters(&self) -> &[(String, String)] {
        &self.parameters
    }

    pub fn push(&mut self, datapoint: DataPoint) {
        self.datapoints.push(datapoint);
    }

    pub fn datapoints(&self) -> &[DataPoint] {
        &self.datapoints
    }

    /// Resolves every attached event into timestamps. All events must have
    /// completed; the events themselves are released.
    pub fn finalize(&mut self) -> Result<()> {
        for dp in &mut self.datapoints {
            dp.finalize()?;
        }
        Ok(())
    }

    /// Flattens the tree into one record per data point.
    pub fn records(&self) -> Vec<Record> {
        let mut records = Vec::new();
        for dp in &self.datapoints {
            flatten(dp, self.run, &mut records);
        }
        records
    }
}

fn flatten(dp: &DataPoint, run: u32, out: &mut Vec<Record>) {
    let (start_ns, end_ns, duration_ns) = match dp.span() {
        Some(span) => span,
        // Host-measured nodes (e.g. the total wall time) carry values only.
        None => (0, dp.value_sum(), dp.value_sum()),
    };
    out.push(Record {
        name: dp.name().to_string(),
        run,
        iteration: dp.iteration(),
        start_ns,
        end_ns,
        duration_ns,
    });
    for child in dp.children() {
        flatten(child, run, out);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spans_aggregate_children() {
        let mut dp = DataPoint::with_iteration("Fused", 3);
        dp.timings.push((100, 200));
        let child = dp.create_child("ReduceCentroids");
        child.timings.push((190, 260));
        let child = dp.create_child("ReduceMasses");
        child.timings.push((250, 300));

        assert_eq!(dp.span(), Some((100, 300, 220)));
        assert_eq!(dp.children()[0].span(), Some((190, 260, 70)));
    }

    #[test]
    fn records_flatten_depth_first() {
        let mut m = Measurement::new(2);
        let mut dp = DataPoint::with_iteration("Fused", 0);
        dp.timings.push((10, 30));
        dp.create_child("ReduceMasses").timings.push((25, 40));
        m.push(dp);

        let mut total = DataPoint::new("TotalTime");
        total.add_value(12345);
        m.push(total);

        let records = m.records();
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].name, "Fused");
        assert_eq!(records[0].run, 2);
        assert_eq!(records[0].iteration, Some(0));
        assert_eq!(records[0].start_ns, 10);
        assert_eq!(records[0].end_ns, 40);
        assert_eq!(records[1].name, "ReduceMasses");
        assert_eq!(records[2].name, "TotalTime");
        assert_eq!(records[2].duration_ns, 12345);
    }

    #[test]
    fn empty_datapoint_has_no_span() {
        let dp = DataPoint::new("Labeling");
        assert_eq!(dp.span(), None);
    }
}
