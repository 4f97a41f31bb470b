use crate::core::state::SynthesisResult;
use crate::services::playback::{PlaybackItem, PlaybackSink};
use log::{debug, error, warn};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::watch;

#[derive(Debug, Default)]
struct PhaseBuffer {
    pending: BTreeMap<usize, SynthesisResult>,
    segment_count: Option<usize>,
}

#[derive(Debug, Default)]
struct SequencerState {
    active_phase: u64,
    active_segment: usize,
    phases: HashMap<u64, PhaseBuffer>,
    next_output_index: u64,
}

pub struct Sequencer {
    state: Mutex<SequencerState>,
    sink: Arc<dyn PlaybackSink>,
    /// Publishes `active_phase`; every phase below it is retired.
    retired: watch::Sender<u64>,
}

impl Sequencer {
    pub fn new(sink: Arc<dyn PlaybackSink>) -> Self {
        let (retired, _) = watch::channel(0);
        Self {
            state: Mutex::new(SequencerState::default()),
            sink,
            retired,
        }
    }

    fn lock(&self) -> MutexGuard<'_, SequencerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Announces how many segments `phase` has. The first announcement wins.
    pub fn report_segment_count(&self, phase: u64, count: usize) {
        let mut state = self.lock();
        if phase < state.active_phase {
            warn!("Ignoring segment count {} for retired phase={}", count, phase);
            return;
        }
        let buffer = state.phases.entry(phase).or_default();
        match buffer.segment_count {
            Some(existing) if existing != count => {
                warn!(
                    "Conflicting segment count for phase={}: keeping {}, ignoring {}",
                    phase, existing, count
                );
                return;
            }
            Some(_) => return,
            None => buffer.segment_count = Some(count),
        }
        debug!("phase={} has {} segments", phase, count);
        self.drain(state);
    }

    pub fn report_segment(&self, result: SynthesisResult) {
        let mut state = self.lock();
        let phase = result.phase_index;
        let segment = result.segment_index;

        if phase < state.active_phase
            || (phase == state.active_phase && segment < state.active_segment)
        {
            warn!("Dropping late result phase={} segment={}", phase, segment);
            return;
        }

        let buffer = state.phases.entry(phase).or_default();
        if let Some(count) = buffer.segment_count {
            if segment >= count {
                warn!(
                    "Dropping out-of-range result phase={} segment={} (count {})",
                    phase, segment, count
                );
                return;
            }
        }
        if buffer.pending.contains_key(&segment) {
            warn!("Dropping duplicate result phase={} segment={}", phase, segment);
            return;
        }
        buffer.pending.insert(segment, result);
        self.drain(state);
    }

    /// Force-completes `phase` with whatever has already been emitted.
    ///
    /// Returns `false` if the phase had already been retired or had a known
    /// count.
    pub fn expire_phase(&self, phase: u64) -> bool {
        let mut state = self.lock();
        if phase < state.active_phase {
            return false;
        }
        let buffer = state.phases.entry(phase).or_default();
        if buffer.segment_count.is_some() {
            return false;
        }
        error!(
            "phase={} never reported its segment count; forcing completion, {} buffered results lost",
            phase,
            buffer.pending.len()
        );
        buffer.segment_count = Some(0);
        self.drain(state);
        true
    }

    fn drain(&self, mut guard: MutexGuard<'_, SequencerState>) {
        let state = &mut *guard;
        let start_phase = state.active_phase;

        loop {
            let phase = state.active_phase;
            let buffer = state.phases.entry(phase).or_default();

            while let Some(result) = buffer.pending.remove(&state.active_segment) {
                let output_index = state.next_output_index;
                state.next_output_index += 1;
                state.active_segment += 1;
                debug!(
                    "Emitting #{} phase={} segment={}",
                    output_index, result.phase_index, result.segment_index
                );
                self.sink.enqueue(PlaybackItem {
                    audio: result.audio,
                    text: result.text,
                    output_index,
                    phase_index: result.phase_index,
                    segment_index: result.segment_index,
                });
            }

            let leftover = buffer.pending.len();
            match buffer.segment_count {
                Some(count) if state.active_segment >= count => {
                    if leftover > 0 {
                        error!("Discarding {} buffered results of retired phase={}", leftover, phase);
                    }
                    state.phases.remove(&phase);
                    debug!("phase={} retired", phase);
                    state.active_phase += 1;
                    state.active_segment = 0;
                }
                _ => break,
            }
        }

        let active = state.active_phase;
        drop(guard);
        if active != start_phase {
            self.retired.send_replace(active);
        }
    }

    pub fn active_phase(&self) -> u64 {
        self.lock().active_phase
    }

    /// Resolves once every segment of `phase` has been emitted.
    pub async fn wait_retired(&self, phase: u64) {
        let mut rx = self.retired.subscribe();
        // The sender lives as long as `self`, so this cannot fail.
        let _ = rx.wait_for(|active| *active > phase).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::state::AudioArtifact;
    use rand::seq::SliceRandom;
    use std::time::Duration;

    #[derive(Default)]
    struct RecordingSink {
        items: Mutex<Vec<PlaybackItem>>,
    }

    impl PlaybackSink for RecordingSink {
        fn enqueue(&self, item: PlaybackItem) {
            self.items.lock().unwrap().push(item);
        }
    }

    impl RecordingSink {
        fn keys(&self) -> Vec<(u64, usize)> {
            self.items
                .lock()
                .unwrap()
                .iter()
                .map(|i| (i.phase_index, i.segment_index))
                .collect()
        }
    }

    fn result(phase: u64, segment: usize) -> SynthesisResult {
        SynthesisResult {
            phase_index: phase,
            segment_index: segment,
            audio: AudioArtifact::new(vec![phase as u8, segment as u8]),
            text: format!("p{}s{}", phase, segment),
        }
    }

    fn setup() -> (Arc<RecordingSink>, Sequencer) {
        let sink = Arc::new(RecordingSink::default());
        let sequencer = Sequencer::new(sink.clone());
        (sink, sequencer)
    }

    #[test]
    fn test_out_of_order_completions_within_phase() {
        let (sink, seq) = setup();
        seq.report_segment(result(0, 2));
        seq.report_segment(result(0, 0));
        assert_eq!(sink.keys(), vec![(0, 0)]);
        seq.report_segment(result(0, 1));
        seq.report_segment_count(0, 3);

        assert_eq!(sink.keys(), vec![(0, 0), (0, 1), (0, 2)]);
        assert_eq!(seq.active_phase(), 1);

        let indices: Vec<u64> = sink.items.lock().unwrap().iter().map(|i| i.output_index).collect();
        assert_eq!(indices, vec![0, 1, 2]);
    }

    #[test]
    fn test_later_phase_waits_for_earlier() {
        let (sink, seq) = setup();
        seq.report_segment(result(1, 0));
        seq.report_segment_count(1, 1);
        seq.report_segment_count(0, 2);
        assert!(sink.keys().is_empty());

        seq.report_segment(result(0, 1));
        assert!(sink.keys().is_empty());
        seq.report_segment(result(0, 0));

        assert_eq!(sink.keys(), vec![(0, 0), (0, 1), (1, 0)]);
        assert_eq!(seq.active_phase(), 2);
    }

    #[test]
    fn test_zero_length_phase_retires_immediately() {
        let (sink, seq) = setup();
        seq.report_segment(result(1, 0));
        seq.report_segment_count(1, 1);
        seq.report_segment_count(0, 0);

        assert_eq!(sink.keys(), vec![(1, 0)]);
        assert_eq!(seq.active_phase(), 2);
    }

    #[test]
    fn test_any_report_order_gives_lexicographic_output() {
        let counts = [2usize, 0, 3, 1, 0, 4];
        let mut events: Vec<(u64, Option<usize>)> = Vec::new();
        for (phase, &count) in counts.iter().enumerate() {
            events.push((phase as u64, None));
            for segment in 0..count {
                events.push((phase as u64, Some(segment)));
            }
        }
        let expected: Vec<(u64, usize)> = counts
            .iter()
            .enumerate()
            .flat_map(|(p, &c)| (0..c).map(move |s| (p as u64, s)))
            .collect();

        let mut rng = rand::rng();
        for _ in 0..200 {
            events.shuffle(&mut rng);
            let (sink, seq) = setup();
            for &(phase, event) in &events {
                match event {
                    None => seq.report_segment_count(phase, counts[phase as usize]),
                    Some(segment) => seq.report_segment(result(phase, segment)),
                }
            }
            assert_eq!(sink.keys(), expected);
            assert_eq!(seq.active_phase(), counts.len() as u64);
        }
    }

    #[test]
    fn test_late_duplicate_and_out_of_range_dropped() {
        let (sink, seq) = setup();
        seq.report_segment_count(0, 1);
        seq.report_segment(result(0, 0));
        seq.report_segment(result(0, 0));
        seq.report_segment_count(0, 5);

        seq.report_segment_count(1, 1);
        seq.report_segment(result(1, 3));
        seq.report_segment(result(1, 0));

        assert_eq!(sink.keys(), vec![(0, 0), (1, 0)]);
    }

    #[test]
    fn test_expire_phase_unblocks_later_phases() {
        let (sink, seq) = setup();
        seq.report_segment(result(0, 0));
        seq.report_segment(result(0, 2));
        seq.report_segment(result(1, 0));
        seq.report_segment_count(1, 1);
        assert_eq!(sink.keys(), vec![(0, 0)]);

        assert!(seq.expire_phase(0));
        assert!(!seq.expire_phase(0));
        assert_eq!(sink.keys(), vec![(0, 0), (1, 0)]);

        // Arrives after the phase was forced out.
        seq.report_segment(result(0, 1));
        assert_eq!(sink.keys(), vec![(0, 0), (1, 0)]);
    }

    #[tokio::test]
    async fn test_wait_retired() -> anyhow::Result<()> {
        let (_sink, seq) = setup();
        let seq = Arc::new(seq);

        let waiter = {
            let seq = seq.clone();
            tokio::spawn(async move { seq.wait_retired(1).await })
        };
        seq.report_segment_count(0, 0);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        seq.report_segment(result(1, 0));
        seq.report_segment_count(1, 1);
        tokio::time::timeout(Duration::from_secs(1), waiter).await??;
        Ok(())
    }

    #[tokio::test]
    async fn test_concurrent_reports() -> anyhow::Result<()> {
        let (sink, seq) = setup();
        let seq = Arc::new(seq);
        let mut handles = Vec::new();
        for phase in 0..4u64 {
            for segment in 0..5usize {
                let seq = seq.clone();
                handles.push(tokio::spawn(async move {
                    let delay = rand::random_range(0..10);
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                    seq.report_segment(result(phase, segment));
                }));
            }
            let seq = seq.clone();
            handles.push(tokio::spawn(async move {
                seq.report_segment_count(phase, 5);
            }));
        }
        for handle in handles {
            handle.await?;
        }
        let expected: Vec<(u64, usize)> =
            (0..4u64).flat_map(|p| (0..5usize).map(move |s| (p, s))).collect();
        assert_eq!(sink.keys(), expected);
        Ok(())
    }
}
