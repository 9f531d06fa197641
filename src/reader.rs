use crate::error::{SchemeError, SchemeResult};
use crate::heap::{Mutator, Object};
use crate::symbol::sym;
use crate::value::{StrId, SymbolId, Value, VectorId};

/// What the reader needs from its host: allocation plus symbol interning.
pub trait ReaderHost: Mutator {
    fn intern(&mut self, name: &str) -> SymbolId;
}

/// Parses source text into values.
///
/// Every value the reader builds is protected on the host until the
/// outermost `read` returns, so a collection triggered halfway through a
/// long list cannot reclaim the elements read so far.
pub struct Reader<'a, H: ReaderHost> {
    input: &'a [u8],
    pos: usize,
    host: &'a mut H,
}

impl<'a, H: ReaderHost> Reader<'a, H> {
    pub fn new(input: &'a str, host: &'a mut H) -> Self {
        Reader {
            input: input.as_bytes(),
            pos: 0,
            host,
        }
    }

    /// Read one expression. Returns None at end of input.
    pub fn read(&mut self) -> SchemeResult<Option<Value>> {
        self.skip_whitespace_and_comments();
        if self.pos >= self.input.len() {
            return Ok(None);
        }
        let mark = self.host.protected();
        let result = self.read_expr();
        self.host.release(mark);
        result.map(Some)
    }

    /// Return current position in input.
    pub fn position(&self) -> usize {
        self.pos
    }

    fn peek(&self) -> Option<u8> {
        self.input.get(self.pos).copied()
    }

    fn advance(&mut self) -> Option<u8> {
        let ch = self.peek()?;
        self.pos += 1;
        Some(ch)
    }

    fn skip_whitespace_and_comments(&mut self) {
        loop {
            while self.peek().is_some_and(|ch| ch.is_ascii_whitespace()) {
                self.pos += 1;
            }
            if self.peek() == Some(b';') {
                while self.peek().is_some_and(|ch| ch != b'\n') {
                    self.pos += 1;
                }
            } else {
                break;
            }
        }
    }

    fn read_expr(&mut self) -> SchemeResult<Value> {
        self.skip_whitespace_and_comments();

        let ch = self
            .peek()
            .ok_or_else(|| SchemeError::ReadError("unexpected end of input".into()))?;

        let value = match ch {
            b'(' => self.read_list()?,
            b')' => return Err(SchemeError::ReadError("unexpected ')'".into())),
            b'\'' => self.read_quote()?,
            b'"' => self.read_string()?,
            b'#' => self.read_hash()?,
            _ => self.read_word()?,
        };
        self.host.protect(value);
        Ok(value)
    }

    /// Read a list: (a b c) or (a . b) or (a b . c)
    fn read_list(&mut self) -> SchemeResult<Value> {
        self.advance(); // consume '('
        let elements = self.read_sequence()?;
        let mut tail = Value::Null;

        if self.peek() == Some(b'.') && self.is_dot_separator() {
            if elements.is_empty() {
                return Err(SchemeError::ReadError("nothing before '.'".into()));
            }
            self.advance(); // consume '.'
            tail = self.read_expr()?;
            self.skip_whitespace_and_comments();
            if self.peek() != Some(b')') {
                return Err(SchemeError::ReadError("expected ')' after dotted tail".into()));
            }
        }
        self.advance(); // consume ')'
        self.host.list_with_tail(&elements, tail)
    }

    /// Read elements up to (not including) a closing paren or a dot separator.
    fn read_sequence(&mut self) -> SchemeResult<Vec<Value>> {
        let mut elements = Vec::new();
        loop {
            self.skip_whitespace_and_comments();
            match self.peek() {
                None => return Err(SchemeError::ReadError("unterminated list".into())),
                Some(b')') => return Ok(elements),
                Some(b'.') if self.is_dot_separator() => return Ok(elements),
                Some(_) => elements.push(self.read_expr()?),
            }
        }
    }

    /// A '.' is a separator when followed by whitespace, ')' or end of input.
    fn is_dot_separator(&self) -> bool {
        match self.input.get(self.pos + 1) {
            None => true,
            Some(&next) => next.is_ascii_whitespace() || next == b')' || next == b'(',
        }
    }

    /// Read quote: 'expr -> (quote expr)
    fn read_quote(&mut self) -> SchemeResult<Value> {
        self.advance(); // consume '\''
        let expr = self.read_expr()?;
        self.host.list(&[Value::Symbol(sym::QUOTE), expr])
    }

    fn read_string(&mut self) -> SchemeResult<Value> {
        self.advance(); // consume '"'
        let mut bytes = Vec::new();
        loop {
            match self.advance() {
                None => return Err(SchemeError::ReadError("unterminated string".into())),
                Some(b'"') => break,
                Some(b'\\') => match self.advance() {
                    Some(b'n') => bytes.push(b'\n'),
                    Some(b't') => bytes.push(b'\t'),
                    Some(other) => bytes.push(other),
                    None => return Err(SchemeError::ReadError("unterminated string".into())),
                },
                Some(other) => bytes.push(other),
            }
        }
        let text = String::from_utf8(bytes)
            .map_err(|_| SchemeError::ReadError("string is not valid UTF-8".into()))?;
        let slot = self.host.allocate(Object::Str(text))?;
        Ok(Value::Str(StrId(slot)))
    }

    /// `#t`, `#f`, `#\c` and `#( ... )`.
    fn read_hash(&mut self) -> SchemeResult<Value> {
        match self.input.get(self.pos + 1) {
            Some(b'(') => {
                self.pos += 2;
                let elements = self.read_sequence()?;
                if self.peek() != Some(b')') {
                    return Err(SchemeError::ReadError("unexpected '.' in vector".into()));
                }
                self.advance();
                let slot = self.host.allocate(Object::Vector(elements))?;
                Ok(Value::Vector(VectorId(slot)))
            }
            Some(b'\\') => {
                self.pos += 2;
                self.read_char()
            }
            _ => {
                let word = self.take_word();
                match word.as_str() {
                    "#t" | "#true" => Ok(Value::Bool(true)),
                    "#f" | "#false" => Ok(Value::Bool(false)),
                    other => Err(SchemeError::ReadError(format!("unknown syntax {}", other))),
                }
            }
        }
    }

    fn read_char(&mut self) -> SchemeResult<Value> {
        let rest = std::str::from_utf8(&self.input[self.pos..])
            .map_err(|_| SchemeError::ReadError("character is not valid UTF-8".into()))?;
        let first = rest
            .chars()
            .next()
            .ok_or_else(|| SchemeError::ReadError("unexpected end of input after #\\".into()))?;
        self.pos += first.len_utf8();

        // Named characters: the first char is always consumed, so `#\(` works.
        if first.is_ascii_alphabetic() && self.peek().is_some_and(|ch| ch.is_ascii_alphabetic()) {
            let mut name = first.to_string();
            name.push_str(&self.take_word());
            return match name.as_str() {
                "space" => Ok(Value::Char(' ')),
                "newline" => Ok(Value::Char('\n')),
                "tab" => Ok(Value::Char('\t')),
                other => Err(SchemeError::ReadError(format!("unknown character #\\{}", other))),
            };
        }
        Ok(Value::Char(first))
    }

    fn take_word(&mut self) -> String {
        let start = self.pos;
        while self.peek().is_some_and(|ch| !is_delimiter(ch)) {
            self.pos += 1;
        }
        String::from_utf8_lossy(&self.input[start..self.pos]).into_owned()
    }

    fn read_word(&mut self) -> SchemeResult<Value> {
        let word = self.take_word();
        if word.is_empty() {
            return Err(SchemeError::ReadError(format!(
                "unexpected character at byte {}",
                self.pos
            )));
        }
        if let Some(n) = parse_integer(&word) {
            return Ok(Value::Int(n));
        }
        Ok(Value::Symbol(self.host.intern(&word)))
    }
}

fn is_delimiter(ch: u8) -> bool {
    ch.is_ascii_whitespace() || matches!(ch, b'(' | b')' | b'\'' | b'"' | b';')
}

fn parse_integer(word: &str) -> Option<i64> {
    let digits = word.strip_prefix(|c| c == '-' || c == '+').unwrap_or(word);
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    word.parse().ok()
}

/// Net parenthesis depth of `text`, ignoring strings, comments and
/// character literals. Used to decide when a multi-line form is complete.
pub fn paren_depth(text: &str) -> i32 {
    let bytes = text.as_bytes();
    let mut depth = 0;
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'(' => depth += 1,
            b')' => depth -= 1,
            b';' => {
                while i < bytes.len() && bytes[i] != b'\n' {
                    i += 1;
                }
            }
            b'"' => {
                i += 1;
                while i < bytes.len() && bytes[i] != b'"' {
                    if bytes[i] == b'\\' {
                        i += 1;
                    }
                    i += 1;
                }
            }
            b'#' if bytes.get(i + 1) == Some(&b'\\') => i += 2,
            _ => {}
        }
        i += 1;
    }
    depth
}

/// Read one expression starting at byte offset `pos`.
/// Returns `Ok(Some((value, new_pos)))` or `Ok(None)` if only whitespace/comments remain.
pub fn read_one_at<H: ReaderHost>(
    host: &mut H,
    input: &str,
    pos: usize,
) -> SchemeResult<Option<(Value, usize)>> {
    let mut reader = Reader::new(&input[pos..], host);
    match reader.read()? {
        Some(val) => Ok(Some((val, pos + reader.position()))),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::Heap;
    use crate::printer::render;
    use crate::symbol::SymbolTable;

    struct Host {
        heap: Heap,
        symbols: SymbolTable,
    }

    impl Mutator for Host {
        fn heap(&self) -> &Heap {
            &self.heap
        }
        fn heap_mut(&mut self) -> &mut Heap {
            &mut self.heap
        }
        fn allocate(&mut self, object: Object) -> SchemeResult<u32> {
            self.heap.allocate(object)
        }
    }

    impl ReaderHost for Host {
        fn intern(&mut self, name: &str) -> SymbolId {
            self.symbols.intern(name)
        }
    }

    fn host() -> Host {
        Host {
            heap: Heap::new(1 << 16),
            symbols: SymbolTable::new(),
        }
    }

    fn round_trip(text: &str) -> String {
        let mut host = host();
        let (value, _) = read_one_at(&mut host, text, 0).unwrap().unwrap();
        render(&host.heap, &host.symbols, value)
    }

    #[test]
    fn reads_atoms() {
        assert_eq!(round_trip("42"), "42");
        assert_eq!(round_trip("-17"), "-17");
        assert_eq!(round_trip("-"), "-");
        assert_eq!(round_trip("set-car!"), "set-car!");
        assert_eq!(round_trip("#t"), "#t");
        assert_eq!(round_trip("#\\a"), "#\\a");
        assert_eq!(round_trip("#\\space"), "#\\space");
        assert_eq!(round_trip("#\\("), "#\\(");
        assert_eq!(round_trip("\"hi\\n\""), "\"hi\\n\"");
    }

    #[test]
    fn reads_lists_and_dotted_tails() {
        assert_eq!(round_trip("(1 2 3)"), "(1 2 3)");
        assert_eq!(round_trip("(a . b)"), "(a . b)");
        assert_eq!(round_trip("(a b . c)"), "(a b . c)");
        assert_eq!(round_trip("()"), "()");
        assert_eq!(round_trip("(f (g x) ; comment\n y)"), "(f (g x) y)");
        assert_eq!(round_trip("#(1 (2) x)"), "#(1 (2) x)");
    }

    #[test]
    fn quote_expands_to_a_list() {
        assert_eq!(round_trip("'(a b)"), "'(a b)");
        let mut host = host();
        let (value, _) = read_one_at(&mut host, "'x", 0).unwrap().unwrap();
        let items = host.heap.list_to_vec(value).unwrap();
        assert_eq!(items[0], Value::Symbol(sym::QUOTE));
    }

    #[test]
    fn successive_reads_advance_position() {
        let mut host = host();
        let text = "(define x 1) x";
        let (_, next) = read_one_at(&mut host, text, 0).unwrap().unwrap();
        let (second, end) = read_one_at(&mut host, text, next).unwrap().unwrap();
        assert!(second.is_symbol());
        assert_eq!(end, text.len());
        assert_eq!(read_one_at(&mut host, text, end).unwrap(), None);
    }

    #[test]
    fn malformed_input_is_a_read_error() {
        let mut host = host();
        for text in ["(1 2", ")", "(. a)", "(a . b c)", "#q"] {
            assert!(
                matches!(read_one_at(&mut host, text, 0), Err(SchemeError::ReadError(_))),
                "{text}"
            );
        }
    }

    #[test]
    fn paren_depth_ignores_strings_and_comments() {
        assert_eq!(paren_depth("(define (f x)"), 1);
        assert_eq!(paren_depth("(display \")(\")"), 0);
        assert_eq!(paren_depth("(f ; )\n"), 1);
        assert_eq!(paren_depth("#\\( )"), -1);
    }
}
