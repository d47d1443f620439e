// 分片计划
//
// S3 分片上传规则：
// - 除最后一个分片外，每个分片不小于 5MB
// - 单个分片不超过 5GB
// - 单次上传最多 10000 个分片
//
// 分片大小 = max(最小分片大小, ceil(文件大小 / 最大分片数))，
// 超过最大分片大小时返回配置错误。

use crate::config::UploadConfig;
use crate::error::{Result, UploadError};
use serde::{Deserialize, Serialize};
use std::ops::Range;
use tracing::debug;

/// 最小分片大小: 5MB
pub const MIN_PART_SIZE: u64 = 5 * 1024 * 1024;

/// 最大分片大小: 5GB
pub const MAX_PART_SIZE: u64 = 5 * 1024 * 1024 * 1024;

/// 最大分片数量
pub const MAX_PART_COUNT: u32 = 10_000;

/// 单个分片的范围
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartSpec {
    /// 分片序号（从 1 开始）
    pub index: u32,
    /// 起始偏移
    pub offset: u64,
    /// 分片长度
    pub length: u64,
}

impl PartSpec {
    /// 字节范围 [offset, offset + length)
    pub fn range(&self) -> Range<u64> {
        self.offset..self.offset + self.length
    }
}

/// 分片计划（创建后不可变）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadPlan {
    /// 文件总大小
    pub total_size: u64,
    /// 选定的分片大小
    pub part_size: u64,
    /// 按序号排列的分片
    pub parts: Vec<PartSpec>,
}

impl UploadPlan {
    pub fn part_count(&self) -> u32 {
        self.parts.len() as u32
    }

    pub fn part(&self, index: u32) -> Option<&PartSpec> {
        index
            .checked_sub(1)
            .and_then(|i| self.parts.get(i as usize))
    }
}

/// 按上传配置生成分片计划
pub fn plan_for(total_size: u64, config: &UploadConfig) -> Result<UploadPlan> {
    plan(
        total_size,
        config.min_part_size,
        config.max_part_size,
        config.max_part_count,
    )
}

/// 生成分片计划
///
/// # 参数
/// * `total_size` - 文件大小（字节）
/// * `min_part_size` - 最小分片大小
/// * `max_part_size` - 最大分片大小
/// * `max_part_count` - 最大分片数量
///
/// # 返回
/// 覆盖 [0, total_size) 的连续分片；空文件返回一个长度为 0 的分片
pub fn plan(
    total_size: u64,
    min_part_size: u64,
    max_part_size: u64,
    max_part_count: u32,
) -> Result<UploadPlan> {
    if min_part_size == 0 {
        return Err(UploadError::Configuration("最小分片大小不能为 0".to_string()));
    }
    if min_part_size > max_part_size {
        return Err(UploadError::Configuration(format!(
            "最小分片大小 {} 大于最大分片大小 {}",
            min_part_size, max_part_size
        )));
    }
    if max_part_count == 0 {
        return Err(UploadError::Configuration("最大分片数量不能为 0".to_string()));
    }

    let part_size = min_part_size.max(total_size.div_ceil(max_part_count as u64));
    if part_size > max_part_size {
        return Err(UploadError::Configuration(format!(
            "文件过大: {} 字节需要 {} 字节的分片，超过上限 {} 字节（最多 {} 个分片）",
            total_size, part_size, max_part_size, max_part_count
        )));
    }

    let parts = if total_size == 0 {
        vec![PartSpec {
            index: 1,
            offset: 0,
            length: 0,
        }]
    } else {
        let count = total_size.div_ceil(part_size);
        (0..count)
            .map(|i| {
                let offset = i * part_size;
                PartSpec {
                    index: i as u32 + 1,
                    offset,
                    length: part_size.min(total_size - offset),
                }
            })
            .collect()
    };

    debug!(
        "分片计划: 文件大小={}, 分片大小={}, 分片数={}",
        total_size,
        part_size,
        parts.len()
    );

    Ok(UploadPlan {
        total_size,
        part_size,
        parts,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const MB: u64 = 1024 * 1024;

    #[test]
    fn test_three_equal_parts() {
        let plan = plan(15 * MB, 5 * MB, 5 * 1024 * MB, 10_000).unwrap();

        assert_eq!(plan.part_size, 5 * MB);
        assert_eq!(plan.parts.len(), 3);
        assert_eq!(plan.parts[0], PartSpec { index: 1, offset: 0, length: 5 * MB });
        assert_eq!(plan.parts[1], PartSpec { index: 2, offset: 5 * MB, length: 5 * MB });
        assert_eq!(plan.parts[2], PartSpec { index: 3, offset: 10 * MB, length: 5 * MB });
    }

    #[test]
    fn test_three_parts_decimal_sizes() {
        let plan = plan(15_000_000, 5_000_000, 5_000_000_000, 10_000).unwrap();

        assert_eq!(plan.part_size, 5_000_000);
        assert_eq!(plan.part_count(), 3);
        let lengths: Vec<u64> = plan.parts.iter().map(|p| p.length).collect();
        assert_eq!(lengths, vec![5_000_000, 5_000_000, 5_000_000]);
        assert_eq!(plan.parts[2].range(), 10_000_000..15_000_000);
    }

    #[test]
    fn test_short_last_part() {
        let plan = plan(12 * MB, 5 * MB, 5 * 1024 * MB, 10_000).unwrap();
        assert_eq!(plan.parts.len(), 3);
        assert_eq!(plan.parts[2].length, 2 * MB);
        assert_eq!(plan.parts[2].range(), 10 * MB..12 * MB);
    }

    #[test]
    fn test_empty_file_single_part() {
        let plan = plan(0, MIN_PART_SIZE, MAX_PART_SIZE, MAX_PART_COUNT).unwrap();
        assert_eq!(plan.parts, vec![PartSpec { index: 1, offset: 0, length: 0 }]);
    }

    #[test]
    fn test_small_file_single_part() {
        let plan = plan(1024, MIN_PART_SIZE, MAX_PART_SIZE, MAX_PART_COUNT).unwrap();
        assert_eq!(plan.parts.len(), 1);
        assert_eq!(plan.parts[0].length, 1024);
    }

    #[test]
    fn test_part_size_grows_with_count_limit() {
        // 100 字节、最多 4 个分片、最小 10 字节 → 25 字节一片
        let plan = plan(100, 10, 1000, 4).unwrap();
        assert_eq!(plan.part_size, 25);
        assert_eq!(plan.parts.len(), 4);
    }

    #[test]
    fn test_file_too_large() {
        let err = plan(100, 10, 20, 4).unwrap_err();
        assert!(matches!(err, UploadError::Configuration(_)));
    }

    #[test]
    fn test_invalid_limits() {
        assert!(matches!(plan(100, 0, 10, 4), Err(UploadError::Configuration(_))));
        assert!(matches!(plan(100, 20, 10, 4), Err(UploadError::Configuration(_))));
        assert!(matches!(plan(100, 10, 20, 0), Err(UploadError::Configuration(_))));
    }

    #[test]
    fn test_part_lookup() {
        let plan = plan(30, 10, 10, 10).unwrap();
        assert_eq!(plan.part(0), None);
        assert_eq!(plan.part(2).map(|p| p.offset), Some(10));
        assert_eq!(plan.part(4), None);
        assert_eq!(plan.part_count(), 3);
    }

    proptest! {
        #[test]
        fn prop_parts_cover_file_exactly(
            total in 0u64..10_000_000,
            min in 1u64..100_000,
            extra in 0u64..1_000_000,
            max_count in 1u32..500,
        ) {
            let max = min + extra;
            match plan(total, min, max, max_count) {
                Ok(plan) => {
                    prop_assert!(plan.part_count() <= max_count);
                    prop_assert_eq!(plan.parts[0].offset, 0);

                    let mut expected_offset = 0;
                    for (i, part) in plan.parts.iter().enumerate() {
                        prop_assert_eq!(part.index as usize, i + 1);
                        prop_assert_eq!(part.offset, expected_offset);
                        prop_assert!(part.length <= max);
                        if i + 1 < plan.parts.len() {
                            prop_assert!(part.length >= min);
                        }
                        expected_offset += part.length;
                    }
                    prop_assert_eq!(expected_offset, total);
                }
                Err(e) => {
                    // 只有分片数限制迫使分片超过上限时才会失败
                    prop_assert!(matches!(e, UploadError::Configuration(_)));
                    prop_assert!(total.div_ceil(max_count as u64) > max);
                }
            }
        }
    }
}
