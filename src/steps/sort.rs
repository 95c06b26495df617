//! Batch sorting step

use std::cmp::Ordering;
use std::sync::Arc;

use tracing::debug;

use crate::batch::BatchStep;
use crate::sample::{Header, Sample};
use crate::Result;

/// Sorts a batch by the values of the given tags, in order, with the
/// timestamp as the final tiebreak.
pub struct SampleSorter {
    pub tags: Vec<String>,
    description: String,
}

impl SampleSorter {
    pub fn new(tags: Vec<String>) -> Self {
        let mut criteria = tags.clone();
        criteria.push("timestamp".to_string());
        Self {
            tags,
            description: format!("sort by {}", criteria.join(", ")),
        }
    }

    fn compare(&self, a: &Sample, b: &Sample) -> Ordering {
        for tag in &self.tags {
            let ordering = a.tag(tag).cmp(b.tag(tag));
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        a.time.cmp(&b.time)
    }
}

impl BatchStep for SampleSorter {
    fn name(&self) -> &str {
        &self.description
    }

    fn process_batch(
        &mut self,
        header: Arc<Header>,
        mut samples: Vec<Sample>,
    ) -> Result<(Arc<Header>, Vec<Sample>)> {
        debug!("[{}] sorting {} samples", self.description, samples.len());
        samples.sort_by(|a, b| self.compare(a, b));
        Ok((header, samples))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(nanos: i64, host: &str) -> Sample {
        let mut sample = Sample::from_nanos(nanos, vec![0.0]);
        sample.set_tag("host", host);
        sample
    }

    #[test]
    fn test_sort_by_tag_then_time() {
        let header = Arc::new(Header::new(vec!["x".into()], true));
        let samples = vec![
            sample(30, "b"),
            sample(20, "a"),
            sample(10, "b"),
            sample(40, "a"),
        ];
        let mut sorter = SampleSorter::new(vec!["host".into()]);
        let (_, sorted) = sorter.process_batch(header, samples).unwrap();

        let order: Vec<(i64, String)> = sorted
            .iter()
            .map(|s| (s.time_nanos(), s.tag("host").to_string()))
            .collect();
        assert_eq!(
            order,
            vec![
                (20, "a".to_string()),
                (40, "a".to_string()),
                (10, "b".to_string()),
                (30, "b".to_string()),
            ]
        );
    }

    #[test]
    fn test_sort_by_time_only() {
        let header = Arc::new(Header::new(vec!["x".into()], false));
        let samples = vec![
            Sample::from_nanos(3, vec![0.0]),
            Sample::from_nanos(1, vec![0.0]),
            Sample::from_nanos(2, vec![0.0]),
        ];
        let mut sorter = SampleSorter::new(Vec::new());
        let (_, sorted) = sorter.process_batch(header, samples).unwrap();
        let times: Vec<i64> = sorted.iter().map(Sample::time_nanos).collect();
        assert_eq!(times, vec![1, 2, 3]);
    }
}
