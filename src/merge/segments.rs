// 合并分段校验
//
// 合并完成后服务器返回每段在结果视频中的时间范围，
// 必须恰好三段、按陈述序号升序、时间首尾相接。

use crate::merge::types::{SegmentMetadata, StatementClip, STATEMENT_COUNT};
use crate::uploader::error::UploadError;
use std::collections::BTreeSet;

/// 校验服务器返回的分段
///
/// 不满足时返回 PROTOCOL_ERROR，与网络错误区分
pub fn validate_segments(segments: &[SegmentMetadata]) -> Result<(), UploadError> {
    if segments.len() != STATEMENT_COUNT {
        return Err(UploadError::protocol(format!(
            "合并分段数量错误: 期望 {}, 实际 {}",
            STATEMENT_COUNT,
            segments.len()
        )));
    }

    for segment in segments {
        if segment.end_time_ms < segment.start_time_ms {
            return Err(UploadError::protocol(format!(
                "陈述 #{} 的分段结束时间早于开始时间: {} < {}",
                segment.statement_index, segment.end_time_ms, segment.start_time_ms
            )));
        }
    }

    for pair in segments.windows(2) {
        let (prev, next) = (&pair[0], &pair[1]);
        if next.statement_index <= prev.statement_index {
            return Err(UploadError::protocol(format!(
                "合并分段未按陈述序号升序: #{} 之后是 #{}",
                prev.statement_index, next.statement_index
            )));
        }
        if prev.end_time_ms != next.start_time_ms {
            return Err(UploadError::protocol(format!(
                "合并分段不连续: #{} 结束于 {}ms, #{} 开始于 {}ms",
                prev.statement_index, prev.end_time_ms, next.statement_index, next.start_time_ms
            )));
        }
    }

    Ok(())
}

/// 校验分段与提交的三段一一对应
pub fn validate_segments_for(
    segments: &[SegmentMetadata],
    clips: &[StatementClip],
) -> Result<(), UploadError> {
    validate_segments(segments)?;

    let expected: BTreeSet<u8> = clips.iter().map(|c| c.statement_index).collect();
    let actual: BTreeSet<u8> = segments.iter().map(|s| s.statement_index).collect();
    if expected != actual {
        return Err(UploadError::protocol(format!(
            "合并分段的陈述序号 {:?} 与提交的 {:?} 不一致",
            actual, expected
        )));
    }
    Ok(())
}

/// 按各段时长推算的分段（升序拼接）
pub fn expected_segments(clips: &[StatementClip]) -> Vec<SegmentMetadata> {
    let mut ordered: Vec<&StatementClip> = clips.iter().collect();
    ordered.sort_by_key(|c| c.statement_index);

    let mut cursor = 0u64;
    ordered
        .into_iter()
        .map(|clip| {
            let start = cursor;
            cursor = cursor.saturating_add(clip.duration_ms);
            SegmentMetadata::new(clip.statement_index, start, cursor)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::uploader::error::UploadErrorKind;
    use proptest::prelude::*;

    fn clips(durations: [u64; 3]) -> Vec<StatementClip> {
        durations
            .iter()
            .enumerate()
            .map(|(i, d)| StatementClip::new(i as u8, format!("clip-{}.mp4", i), *d))
            .collect()
    }

    #[test]
    fn test_expected_segments() {
        let segments = expected_segments(&clips([5000, 6000, 5000]));
        assert_eq!(
            segments,
            vec![
                SegmentMetadata::new(0, 0, 5000),
                SegmentMetadata::new(1, 5000, 11000),
                SegmentMetadata::new(2, 11000, 16000),
            ]
        );
        assert!(validate_segments(&segments).is_ok());
    }

    #[test]
    fn test_expected_segments_sorts_by_index() {
        let mut input = clips([1000, 2000, 3000]);
        input.reverse();
        let segments = expected_segments(&input);
        assert_eq!(segments[0], SegmentMetadata::new(0, 0, 1000));
        assert_eq!(segments[2], SegmentMetadata::new(2, 3000, 6000));
    }

    #[test]
    fn test_wrong_count() {
        let segments = vec![SegmentMetadata::new(0, 0, 5000), SegmentMetadata::new(1, 5000, 9000)];
        let err = validate_segments(&segments).unwrap_err();
        assert_eq!(err.kind, UploadErrorKind::ProtocolError);
    }

    #[test]
    fn test_gap_and_order() {
        let gap = vec![
            SegmentMetadata::new(0, 0, 5000),
            SegmentMetadata::new(1, 5001, 11000),
            SegmentMetadata::new(2, 11000, 16000),
        ];
        assert!(validate_segments(&gap).is_err());

        let unordered = vec![
            SegmentMetadata::new(1, 0, 5000),
            SegmentMetadata::new(0, 5000, 11000),
            SegmentMetadata::new(2, 11000, 16000),
        ];
        assert!(validate_segments(&unordered).is_err());

        let inverted = vec![
            SegmentMetadata::new(0, 0, 5000),
            SegmentMetadata::new(1, 5000, 4000),
            SegmentMetadata::new(2, 4000, 16000),
        ];
        assert!(validate_segments(&inverted).is_err());
    }

    #[test]
    fn test_indices_must_match_clips() {
        let segments = vec![
            SegmentMetadata::new(0, 0, 5000),
            SegmentMetadata::new(1, 5000, 11000),
            SegmentMetadata::new(3, 11000, 16000),
        ];
        assert!(validate_segments(&segments).is_ok());
        let err = validate_segments_for(&segments, &clips([5000, 6000, 5000])).unwrap_err();
        assert_eq!(err.kind, UploadErrorKind::ProtocolError);
    }

    proptest! {
        #[test]
        fn prop_expected_segments_always_valid(
            durations in proptest::array::uniform3(0u64..600_000),
        ) {
            let input = clips(durations);
            let segments = expected_segments(&input);
            prop_assert!(validate_segments_for(&segments, &input).is_ok());
            prop_assert_eq!(segments[2].end_time_ms, durations.iter().sum::<u64>());
        }

        #[test]
        fn prop_shifted_boundary_is_rejected(
            durations in proptest::array::uniform3(1u64..600_000),
            boundary in 0usize..2,
            shift in 1u64..1000,
        ) {
            let mut segments = expected_segments(&clips(durations));
            segments[boundary + 1].start_time_ms += shift;
            prop_assert!(validate_segments(&segments).is_err());
        }
    }
}
