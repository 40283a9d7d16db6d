//! Folding a frame-property trace into fixed-property segments.

use std::fmt;

use serde::Serialize;

/// One decoded frame as reported by the probe.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameSample {
    pub timestamp: f64,
    pub width: u32,
    pub height: u32,
}

impl FrameSample {
    /// Parses one `timestamp,width,height` line. Frames without a usable
    /// timestamp yield `None`.
    pub fn parse_csv(line: &str) -> Option<Self> {
        let mut fields = line.trim().trim_end_matches(',').split(',');
        let timestamp = fields.next()?.trim().parse::<f64>().ok()?;
        let width = fields.next()?.trim().parse().ok()?;
        let height = fields.next()?.trim().parse().ok()?;
        if fields.next().is_some() || !timestamp.is_finite() {
            return None;
        }
        Some(Self {
            timestamp,
            width,
            height,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VideoSegment {
    pub start: f64,
    pub end: f64,
    pub width: u32,
    pub height: u32,
    pub fps: f64,
    pub frame_count: u64,
}

impl VideoSegment {
    pub fn duration(&self) -> f64 {
        (self.end - self.start).max(0.0)
    }

    pub fn resolution(&self) -> (u32, u32) {
        (self.width, self.height)
    }
}

/// Dominant signature of a recording: resolution plus rounded frame rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct MainProperties {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
}

impl MainProperties {
    pub fn matches(&self, segment: &VideoSegment, fps_tolerance: f64) -> bool {
        segment.width == self.width
            && segment.height == self.height
            && (segment.fps - f64::from(self.fps)).abs() <= fps_tolerance
    }
}

impl fmt::Display for MainProperties {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}@{}fps", self.width, self.height, self.fps)
    }
}

#[derive(Debug, Clone, Copy)]
struct Run {
    first_ts: f64,
    last_ts: f64,
    width: u32,
    height: u32,
    frames: u64,
}

impl Run {
    fn start(sample: FrameSample) -> Self {
        Self {
            first_ts: sample.timestamp,
            last_ts: sample.timestamp,
            width: sample.width,
            height: sample.height,
            frames: 1,
        }
    }

    fn fps(&self) -> f64 {
        let span = self.last_ts - self.first_ts;
        if self.frames < 2 || span <= 0.0 {
            return 0.0;
        }
        (self.frames - 1) as f64 / span
    }

    fn mean_interval(&self) -> f64 {
        if self.frames < 2 {
            return 0.0;
        }
        (self.last_ts - self.first_ts).max(0.0) / (self.frames - 1) as f64
    }
}

/// Incremental fold over the probe output. Each change of width or height
/// closes the current run; [`SegmentBuilder::finish`] turns runs into a gap
/// free partition of the trace.
#[derive(Debug)]
pub struct SegmentBuilder {
    min_segment: f64,
    current: Option<Run>,
    runs: Vec<Run>,
    frames: u64,
}

impl SegmentBuilder {
    pub fn new(min_segment_seconds: f64) -> Self {
        Self {
            min_segment: min_segment_seconds.max(0.0),
            current: None,
            runs: Vec::new(),
            frames: 0,
        }
    }

    pub fn frames(&self) -> u64 {
        self.frames
    }

    pub fn push(&mut self, sample: FrameSample) {
        self.frames += 1;
        match self.current.as_mut() {
            Some(run) if run.width == sample.width && run.height == sample.height => {
                run.last_ts = run.last_ts.max(sample.timestamp);
                run.frames += 1;
            }
            Some(_) => {
                if let Some(done) = self.current.replace(Run::start(sample)) {
                    self.runs.push(done);
                }
            }
            None => self.current = Some(Run::start(sample)),
        }
    }

    pub fn finish(mut self) -> Vec<VideoSegment> {
        if let Some(run) = self.current.take() {
            self.runs.push(run);
        }
        let count = self.runs.len();
        let mut segments: Vec<VideoSegment> = Vec::with_capacity(count);
        for (index, run) in self.runs.iter().enumerate() {
            let end = match self.runs.get(index + 1) {
                Some(next) => next.first_ts.max(run.last_ts),
                None => run.last_ts + run.mean_interval(),
            };
            segments.push(VideoSegment {
                start: run.first_ts,
                end,
                width: run.width,
                height: run.height,
                fps: run.fps(),
                frame_count: run.frames,
            });
        }
        absorb_noise(segments, self.min_segment)
    }
}

/// Folds segments shorter than `min_segment` into a neighbour so the result
/// still covers the whole trace, then merges neighbours that ended up with
/// the same resolution.
fn absorb_noise(segments: Vec<VideoSegment>, min_segment: f64) -> Vec<VideoSegment> {
    if segments.len() < 2 {
        return segments;
    }
    let mut kept: Vec<VideoSegment> = Vec::with_capacity(segments.len());
    let mut leading: Option<VideoSegment> = None;
    for segment in segments {
        if segment.duration() >= min_segment {
            let mut segment = segment;
            if let Some(noise) = leading.take() {
                segment.start = noise.start;
                segment.frame_count += noise.frame_count;
            }
            kept.push(segment);
            continue;
        }
        match kept.last_mut() {
            Some(previous) => {
                previous.end = segment.end;
                previous.frame_count += segment.frame_count;
            }
            None => {
                leading = Some(match leading.take() {
                    Some(mut noise) => {
                        noise.end = segment.end;
                        noise.frame_count += segment.frame_count;
                        noise
                    }
                    None => segment,
                });
            }
        }
    }
    if let Some(noise) = leading {
        // Nothing in the trace reached the minimum length.
        kept.push(noise);
    }

    let mut merged: Vec<VideoSegment> = Vec::with_capacity(kept.len());
    for segment in kept {
        match merged.last_mut() {
            Some(previous) if previous.resolution() == segment.resolution() => {
                let (a, b) = (previous.duration(), segment.duration());
                if a + b > 0.0 {
                    previous.fps = (previous.fps * a + segment.fps * b) / (a + b);
                }
                previous.end = segment.end;
                previous.frame_count += segment.frame_count;
            }
            _ => merged.push(segment),
        }
    }
    merged
}

/// Duration-weighted mode over `(width, height, round(fps))`. Ties go to
/// the key seen first.
pub fn main_properties(segments: &[VideoSegment]) -> Option<MainProperties> {
    let mut totals: Vec<(MainProperties, f64)> = Vec::new();
    for segment in segments {
        let key = MainProperties {
            width: segment.width,
            height: segment.height,
            fps: segment.fps.round().max(0.0) as u32,
        };
        match totals.iter_mut().find(|(existing, _)| *existing == key) {
            Some((_, total)) => *total += segment.duration(),
            None => totals.push((key, segment.duration())),
        }
    }
    let mut best: Option<(MainProperties, f64)> = None;
    for (key, total) in totals {
        if best.map_or(true, |(_, best_total)| total > best_total) {
            best = Some((key, total));
        }
    }
    best.map(|(key, _)| key)
}

/// Result of classifying every segment of a recording.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DetectionReport {
    pub segments: Vec<VideoSegment>,
    pub content: Vec<VideoSegment>,
    pub ads: Vec<VideoSegment>,
    pub main: MainProperties,
}

impl DetectionReport {
    pub fn classify(segments: Vec<VideoSegment>, fps_tolerance: f64) -> Option<Self> {
        let main = main_properties(&segments)?;
        let (content, ads) = segments
            .iter()
            .cloned()
            .partition(|segment| main.matches(segment, fps_tolerance));
        Some(Self {
            segments,
            content,
            ads,
            main,
        })
    }

    pub fn has_ads(&self) -> bool {
        !self.ads.is_empty()
    }

    pub fn ad_seconds(&self) -> f64 {
        self.ads.iter().map(VideoSegment::duration).sum()
    }

    /// Timestamp of the first frame. Transport streams rarely start at 0.
    pub fn origin(&self) -> f64 {
        self.segments.first().map_or(0.0, |segment| segment.start)
    }

    /// Content time ranges with touching neighbours joined, relative to
    /// the first frame. ffmpeg rebases input timestamps to 0 unless
    /// `-copyts` is given, so these feed `trim` directly.
    pub fn content_ranges(&self) -> Vec<(f64, f64)> {
        let origin = self.origin();
        let mut ranges: Vec<(f64, f64)> = Vec::new();
        for segment in &self.content {
            let (start, end) = (segment.start - origin, segment.end - origin);
            match ranges.last_mut() {
                Some((_, last_end)) if (start - *last_end).abs() < 1e-6 => *last_end = end,
                _ => ranges.push((start, end)),
            }
        }
        ranges
    }

    /// Maps an offset from the start of the recording onto the ad-free
    /// output. Offsets that fall inside an ad have no counterpart.
    pub fn remap_offset(&self, offset: f64) -> Option<f64> {
        let origin = self.origin();
        let pts = origin + offset;
        let mut removed = 0.0;
        for ad in &self.ads {
            if pts >= ad.end {
                removed += ad.duration();
            } else if pts >= ad.start {
                return None;
            }
        }
        Some((pts - origin - removed).max(0.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trace(builder: &mut SegmentBuilder, from: f64, to: f64, fps: f64, width: u32, height: u32) {
        let frames = ((to - from) * fps).round() as u64;
        for index in 0..frames {
            builder.push(FrameSample {
                timestamp: from + index as f64 / fps,
                width,
                height,
            });
        }
    }

    fn three_segment_report() -> DetectionReport {
        let mut builder = SegmentBuilder::new(1.0);
        trace(&mut builder, 0.0, 100.0, 60.0, 1280, 720);
        trace(&mut builder, 100.0, 110.0, 30.0, 640, 360);
        trace(&mut builder, 110.0, 400.0, 60.0, 1280, 720);
        DetectionReport::classify(builder.finish(), 2.0).unwrap()
    }

    #[test]
    fn parses_probe_lines() {
        assert_eq!(
            FrameSample::parse_csv("12.500000,1920,1080"),
            Some(FrameSample {
                timestamp: 12.5,
                width: 1920,
                height: 1080
            })
        );
        assert_eq!(FrameSample::parse_csv("1.0,1280,720,"), FrameSample::parse_csv("1.0,1280,720"));
        assert_eq!(FrameSample::parse_csv("N/A,1920,1080"), None);
        assert_eq!(FrameSample::parse_csv("1.0,1920"), None);
    }

    #[test]
    fn ad_break_in_the_middle_is_classified() {
        let report = three_segment_report();
        assert_eq!(
            report.main,
            MainProperties {
                width: 1280,
                height: 720,
                fps: 60
            }
        );
        assert_eq!(report.segments.len(), 3);
        assert_eq!(report.ads.len(), 1);
        let ad = &report.ads[0];
        assert!((ad.start - 100.0).abs() < 1e-6);
        assert!((ad.end - 110.0).abs() < 1e-6);
        assert!((ad.fps - 30.0).abs() < 0.1);

        let ranges = report.content_ranges();
        assert_eq!(ranges.len(), 2);
        assert!((ranges[0].0 - 0.0).abs() < 1e-6 && (ranges[0].1 - 100.0).abs() < 1e-6);
        assert!((ranges[1].0 - 110.0).abs() < 1e-6 && (ranges[1].1 - 400.0).abs() < 1e-6);
    }

    #[test]
    fn segments_partition_the_trace() {
        let report = three_segment_report();
        for pair in report.segments.windows(2) {
            assert_eq!(pair[0].end, pair[1].start);
        }
        assert_eq!(report.segments[0].start, 0.0);
        assert!((report.segments[2].end - 400.0).abs() < 1e-6);
    }

    #[test]
    fn main_properties_weight_by_duration_not_count() {
        let mut builder = SegmentBuilder::new(1.0);
        trace(&mut builder, 0.0, 5.0, 30.0, 640, 360);
        trace(&mut builder, 5.0, 100.0, 60.0, 1920, 1080);
        trace(&mut builder, 100.0, 105.0, 30.0, 640, 360);
        trace(&mut builder, 105.0, 110.0, 30.0, 1280, 720);
        trace(&mut builder, 110.0, 115.0, 30.0, 640, 360);
        let report = DetectionReport::classify(builder.finish(), 2.0).unwrap();
        assert_eq!(report.main.width, 1920);
        assert_eq!(report.content.len(), 1);
        assert_eq!(report.ads.len(), 4);
    }

    #[test]
    fn constant_trace_has_no_ads() {
        let mut builder = SegmentBuilder::new(1.0);
        trace(&mut builder, 0.0, 60.0, 30.0, 1920, 1080);
        let report = DetectionReport::classify(builder.finish(), 2.0).unwrap();
        assert!(!report.has_ads());
        assert_eq!(report.content.len(), 1);
    }

    #[test]
    fn short_blips_are_absorbed_without_gaps() {
        let mut builder = SegmentBuilder::new(1.0);
        trace(&mut builder, 0.0, 50.0, 30.0, 1920, 1080);
        trace(&mut builder, 50.0, 50.2, 30.0, 1280, 720);
        trace(&mut builder, 50.2, 100.0, 30.0, 1920, 1080);
        let segments = builder.finish();
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].start, 0.0);
        assert!((segments[0].end - 100.0).abs() < 1e-6);
    }

    #[test]
    fn leading_noise_joins_the_next_segment() {
        let mut builder = SegmentBuilder::new(1.0);
        trace(&mut builder, 0.0, 0.5, 30.0, 640, 360);
        trace(&mut builder, 0.5, 20.0, 30.0, 1920, 1080);
        let segments = builder.finish();
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].start, 0.0);
        assert_eq!(segments[0].width, 1920);
    }

    #[test]
    fn fps_tolerance_keeps_near_rates_as_content() {
        let main = MainProperties {
            width: 1920,
            height: 1080,
            fps: 60,
        };
        let mut segment = VideoSegment {
            start: 0.0,
            end: 10.0,
            width: 1920,
            height: 1080,
            fps: 58.5,
            frame_count: 585,
        };
        assert!(main.matches(&segment, 2.0));
        segment.fps = 57.5;
        assert!(!main.matches(&segment, 2.0));
    }

    #[test]
    fn offsets_shift_past_removed_ads() {
        let report = three_segment_report();
        assert_eq!(report.remap_offset(50.0), Some(50.0));
        assert_eq!(report.remap_offset(105.0), None);
        let shifted = report.remap_offset(120.0).unwrap();
        assert!((shifted - 110.0).abs() < 1e-6);
    }

    #[test]
    fn offsets_are_measured_from_the_first_frame() {
        let mut builder = SegmentBuilder::new(1.0);
        trace(&mut builder, 10.0, 110.0, 60.0, 1280, 720);
        trace(&mut builder, 110.0, 120.0, 30.0, 640, 360);
        trace(&mut builder, 120.0, 410.0, 60.0, 1280, 720);
        let report = DetectionReport::classify(builder.finish(), 2.0).unwrap();
        assert!((report.origin() - 10.0).abs() < 1e-6);

        assert_eq!(report.remap_offset(50.0), Some(50.0));
        // 105s into the video is 115s of stream time, inside the ad
        assert_eq!(report.remap_offset(105.0), None);
        let shifted = report.remap_offset(150.0).unwrap();
        assert!((shifted - 140.0).abs() < 1e-6);

        let ranges = report.content_ranges();
        assert_eq!(ranges.len(), 2);
        assert!(ranges[0].0.abs() < 1e-6 && (ranges[0].1 - 100.0).abs() < 1e-6);
        assert!((ranges[1].0 - 110.0).abs() < 1e-6 && (ranges[1].1 - 400.0).abs() < 1e-6);
    }

    #[test]
    fn empty_trace_has_no_report() {
        let builder = SegmentBuilder::new(1.0);
        assert!(builder.finish().is_empty());
        assert!(DetectionReport::classify(Vec::new(), 2.0).is_none());
    }
}
