use crate::core::id::NEXT_ID_KEY;

/// key → 两级目录段。
///
/// 取 key 的最后 4 个字符（不足 4 个时左侧补空格），尾部两个字符在前：
/// `"12345"` → `["45", "23"]`，`"7"` → `[" 7", "  "]`。
/// 元数据 key 不分片（存放在顶层）。
///
/// 该映射就是磁盘布局，必须保持稳定。
pub fn shard(key: &str) -> Vec<String> {
    if key == NEXT_ID_KEY {
        return Vec::new();
    }

    let chars: Vec<char> = key.chars().collect();
    let tail: Vec<char> = if chars.len() < 4 {
        std::iter::repeat(' ')
            .take(4 - chars.len())
            .chain(chars)
            .collect()
    } else {
        chars[chars.len() - 4..].to_vec()
    };

    vec![tail[2..4].iter().collect(), tail[0..2].iter().collect()]
}
