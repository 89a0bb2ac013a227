use std::collections::HashSet;
use std::io::Write;
use std::time::SystemTime;

use flate2::write::GzEncoder;
use flate2::Compression;
use prost::Message;

use super::profile::{Function, Label, Line, Location, Profile, Sample, ValueType};
use crate::error::SerializationError;
use crate::location_table::Location as TableLocation;
use crate::sample::{SampleKind, SampleRecord};
use crate::string_table::{InternedStr, StringIndex, Vocabulary};

/// Builds one pprof profile out of sample records.
///
/// Holds a frozen [`StringIndex`], so it can run without the collector lock
/// while the live tables keep changing.
pub struct SerializationContext {
    strings: StringIndex,
    vocabulary: Vocabulary,
    profile: Profile,
    // Functions and locations already emitted into `profile`, by id.
    added_functions: HashSet<u64>,
    added_locations: HashSet<u64>,
    output: Vec<u8>,
}

impl SerializationContext {
    pub fn new(strings: StringIndex, vocabulary: Vocabulary) -> Result<Self, SerializationError> {
        let mut ctx = Self {
            profile: Profile {
                string_table: strings.to_string_vec(),
                time_nanos: SystemTime::now()
                    .duration_since(SystemTime::UNIX_EPOCH)
                    .map(|d| d.as_nanos() as i64)
                    .unwrap_or(0),
                period: 1,
                ..Default::default()
            },
            strings,
            vocabulary,
            added_functions: HashSet::new(),
            added_locations: HashSet::new(),
            output: vec![],
        };

        let sample_type = ValueType {
            ty: ctx.position("ValueType.type", &ctx.vocabulary.allocations)?,
            unit: ctx.position("ValueType.unit", &ctx.vocabulary.count)?,
        };
        ctx.profile.sample_type.push(sample_type.clone());
        ctx.profile.period_type = Some(sample_type);
        Ok(ctx)
    }

    fn position(&self, field: &'static str, s: &InternedStr) -> Result<i64, SerializationError> {
        self.strings
            .position_of(s)
            .ok_or_else(|| SerializationError::NonInternedString {
                field,
                value: s.as_str().to_owned(),
            })
    }

    /// Appends one sample (value 1) for `record`.
    pub fn add_sample(&mut self, record: &SampleRecord, kind: SampleKind) -> Result<(), SerializationError> {
        let frames = record.backtrace().frames();
        let mut location_ids = Vec::with_capacity(frames.len());

        // Backtraces are stored most-recent-call-last; pprof wants the leaf first.
        for location in frames.iter().rev() {
            self.add_function(location)?;
            self.add_location(location);
            location_ids.push(location.id);
        }

        let kind_value = match kind {
            SampleKind::Allocation => &self.vocabulary.allocation,
            SampleKind::Heap => &self.vocabulary.heap,
        };
        let label = vec![
            Label {
                key: self.position("Label.key", &self.vocabulary.kind)?,
                str: self.position("Label.str", kind_value)?,
                ..Default::default()
            },
            Label {
                key: self.position("Label.key", &self.vocabulary.allocation_size)?,
                num: record.allocation_size() as i64,
                num_unit: self.position("Label.num_unit", &self.vocabulary.bytes)?,
                ..Default::default()
            },
            Label {
                key: self.position("Label.key", &self.vocabulary.current_size)?,
                num: record.current_size() as i64,
                num_unit: self.position("Label.num_unit", &self.vocabulary.bytes)?,
                ..Default::default()
            },
        ];

        self.profile.sample.push(Sample {
            location_id: location_ids,
            value: vec![1],
            label,
        });
        Ok(())
    }

    fn add_function(&mut self, location: &TableLocation) -> Result<(), SerializationError> {
        let function = &location.function;
        if self.added_functions.contains(&function.id) {
            return Ok(());
        }
        let name = self.position("Function.name", &function.name)?;
        let filename = self.position("Function.filename", &function.file_name)?;
        self.profile.function.push(Function {
            id: function.id,
            name,
            system_name: name,
            filename,
            start_line: function.start_line,
        });
        self.added_functions.insert(function.id);
        Ok(())
    }

    fn add_location(&mut self, location: &TableLocation) {
        if !self.added_locations.insert(location.id) {
            return;
        }
        self.profile.location.push(Location {
            id: location.id,
            line: vec![Line {
                function_id: location.function.id,
                line: location.line,
            }],
            ..Default::default()
        });
    }

    pub fn sample_count(&self) -> usize {
        self.profile.sample.len()
    }

    /// Encodes and gzips the profile. The returned buffer lives as long as the
    /// context; copy it out before dropping the context.
    pub fn serialize(&mut self) -> Result<&[u8], SerializationError> {
        let mut encoded = Vec::with_capacity(self.profile.encoded_len());
        self.profile.encode(&mut encoded)?;

        let mut encoder = GzEncoder::new(Vec::with_capacity(encoded.len() / 2), Compression::default());
        encoder.write_all(&encoded)?;
        self.output = encoder.finish()?;
        Ok(&self.output)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::host::{CapturedFrame, ObjectHandle};
    use crate::location_table::LocationTable;
    use crate::string_table::StringTable;
    use flate2::read::GzDecoder;
    use std::io::Read;

    pub(crate) fn decode(bytes: &[u8]) -> Profile {
        let mut decompressed = vec![];
        GzDecoder::new(bytes).read_to_end(&mut decompressed).unwrap();
        Profile::decode(decompressed.as_slice()).unwrap()
    }

    fn frames(names: &[(&str, i64)]) -> Vec<CapturedFrame> {
        names
            .iter()
            .map(|(name, line)| CapturedFrame::new(*name, "app.rb", 1, *line))
            .collect()
    }

    #[test]
    fn test_serialize_reverses_frames_and_dedups() {
        let mut strings = StringTable::new();
        let mut locations = LocationTable::new();
        let bt1 = locations.intern_backtrace(&mut strings, &frames(&[("main", 1), ("outer", 5), ("inner", 9)]));
        let bt2 = locations.intern_backtrace(&mut strings, &frames(&[("main", 1), ("outer", 6)]));
        let leaf_id = bt1.frames()[2].id;
        let root_id = bt1.frames()[0].id;

        let r1 = SampleRecord::new(bt1, ObjectHandle(1), 40);
        let r2 = SampleRecord::new(bt2, ObjectHandle(2), 80);

        let mut ctx = SerializationContext::new(strings.snapshot_index(), strings.vocabulary().clone()).unwrap();
        ctx.add_sample(&r1, SampleKind::Allocation).unwrap();
        ctx.add_sample(&r2, SampleKind::Heap).unwrap();
        ctx.add_sample(&r1, SampleKind::Heap).unwrap();
        let profile = decode(ctx.serialize().unwrap());

        assert_eq!(profile.sample.len(), 3);
        assert_eq!(profile.sample[0].location_id.first(), Some(&leaf_id));
        assert_eq!(profile.sample[0].location_id.last(), Some(&root_id));
        assert_eq!(profile.sample[0].value, vec![1]);
        // main@1, outer@5, inner@9, outer@6
        assert_eq!(profile.location.len(), 4);
        assert_eq!(profile.function.len(), 3);

        let function_ids: HashSet<u64> = profile.function.iter().map(|f| f.id).collect();
        for location in profile.location.iter() {
            assert!(function_ids.contains(&location.line[0].function_id));
        }

        let st = &profile.string_table;
        assert_eq!(st[0], "");
        assert_eq!(st[profile.sample_type[0].ty as usize], "allocations");
        assert_eq!(st[profile.sample_type[0].unit as usize], "count");
        let inner = profile.function.iter().find(|f| st[f.name as usize] == "inner").unwrap();
        assert_eq!(st[inner.filename as usize], "app.rb");
    }

    #[test]
    fn test_sample_labels() {
        let mut strings = StringTable::new();
        let mut locations = LocationTable::new();
        let bt = locations.intern_backtrace(&mut strings, &frames(&[("main", 1)]));
        let record = SampleRecord::new(bt, ObjectHandle(1), 40);
        record.set_current_size(64);

        let mut ctx = SerializationContext::new(strings.snapshot_index(), strings.vocabulary().clone()).unwrap();
        ctx.add_sample(&record, SampleKind::Heap).unwrap();
        let profile = decode(ctx.serialize().unwrap());

        let st = &profile.string_table;
        let labels = &profile.sample[0].label;
        let kind = labels.iter().find(|l| st[l.key as usize] == "kind").unwrap();
        assert_eq!(st[kind.str as usize], "heap");
        let current = labels.iter().find(|l| st[l.key as usize] == "current_size").unwrap();
        assert_eq!(current.num, 64);
        assert_eq!(st[current.num_unit as usize], "bytes");
    }

    #[test]
    fn test_string_missing_from_snapshot_is_an_error() {
        let mut strings = StringTable::new();
        let mut locations = LocationTable::new();
        let index = strings.snapshot_index();
        let bt = locations.intern_backtrace(&mut strings, &frames(&[("late", 1)]));
        let record = SampleRecord::new(bt, ObjectHandle(1), 40);

        let mut ctx = SerializationContext::new(index, strings.vocabulary().clone()).unwrap();
        let err = ctx.add_sample(&record, SampleKind::Allocation).unwrap_err();
        assert!(matches!(err, SerializationError::NonInternedString { field: "Function.name", .. }));
    }

    #[test]
    fn test_empty_profile() {
        let strings = StringTable::new();
        let mut ctx = SerializationContext::new(strings.snapshot_index(), strings.vocabulary().clone()).unwrap();
        let profile = decode(ctx.serialize().unwrap());
        assert!(profile.sample.is_empty());
        assert_eq!(profile.period, 1);
    }
}
