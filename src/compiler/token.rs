/// A labeled slice of source text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Token<'source, Label> {
    pub label: Label,
    pub content: &'source str,
    pub offset: usize,
}

/// 1-based line and column of a byte offset.
pub fn line_and_col(source: &str, offset: usize) -> (u32, u32) {
    let offset = offset.min(source.len());
    let mut line = 1;
    let mut line_start = 0;
    for (i, b) in source.as_bytes()[..offset].iter().enumerate() {
        if *b == b'\n' {
            line += 1;
            line_start = i + 1;
        }
    }
    (line, (offset - line_start) as u32 + 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn positions() {
        let source = "ab\ncd\ne";
        assert_eq!(line_and_col(source, 0), (1, 1));
        assert_eq!(line_and_col(source, 1), (1, 2));
        assert_eq!(line_and_col(source, 3), (2, 1));
        assert_eq!(line_and_col(source, 6), (3, 1));
        assert_eq!(line_and_col(source, 100), (3, 2));
    }
}
