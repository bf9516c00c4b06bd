//! 恢复码管理模块
//!
//! 恢复码为 8 位随机数字，格式 `####-####`，每个只能使用一次。

use rand::Rng;

/// 恢复码数量
pub const RECOVERY_CODE_COUNT: usize = 8;

/// 恢复码每段长度
const CODE_SEGMENT_LENGTH: usize = 4;

/// 恢复码管理器
pub struct RecoveryCodeManager;

impl RecoveryCodeManager {
    /// 生成一组恢复码（组内不重复）
    pub fn generate_codes() -> Vec<String> {
        let mut rng = rand::thread_rng();
        let mut codes: Vec<String> = Vec::with_capacity(RECOVERY_CODE_COUNT);
        while codes.len() < RECOVERY_CODE_COUNT {
            let code = Self::generate_single_code(&mut rng);
            if !codes.contains(&code) {
                codes.push(code);
            }
        }
        codes
    }

    fn generate_single_code<R: Rng>(rng: &mut R) -> String {
        let mut segment = || -> String {
            (0..CODE_SEGMENT_LENGTH)
                .map(|_| char::from(b'0' + rng.gen_range(0..10u8)))
                .collect()
        };
        let first = segment();
        let second = segment();
        format!("{}-{}", first, second)
    }

    /// 规范化用户输入
    pub fn normalize(input: &str) -> &str {
        input.trim()
    }

    /// 检查是否符合 `####-####`
    pub fn is_valid_format(code: &str) -> bool {
        let bytes = code.as_bytes();
        bytes.len() == CODE_SEGMENT_LENGTH * 2 + 1
            && bytes[CODE_SEGMENT_LENGTH] == b'-'
            && bytes
                .iter()
                .enumerate()
                .all(|(i, b)| i == CODE_SEGMENT_LENGTH || b.is_ascii_digit())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_codes() {
        let codes = RecoveryCodeManager::generate_codes();
        assert_eq!(codes.len(), RECOVERY_CODE_COUNT);
        for code in &codes {
            assert!(RecoveryCodeManager::is_valid_format(code), "{}", code);
        }
        let mut unique = codes.clone();
        unique.sort();
        unique.dedup();
        assert_eq!(unique.len(), codes.len());
    }

    #[test]
    fn test_format_check() {
        assert!(RecoveryCodeManager::is_valid_format("1234-5678"));
        assert!(!RecoveryCodeManager::is_valid_format("12345678"));
        assert!(!RecoveryCodeManager::is_valid_format("1234-567a"));
        assert!(!RecoveryCodeManager::is_valid_format("ABCD-EFGH"));
        assert!(!RecoveryCodeManager::is_valid_format(""));
    }

    #[test]
    fn test_normalize() {
        assert_eq!(RecoveryCodeManager::normalize("  1234-5678\n"), "1234-5678");
    }
}
