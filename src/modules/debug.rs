//! Debug module: small functions and components for exercising the runtime.
//!
//! | Name          | Kind                | Args                         | Output            |
//! |---------------|---------------------|------------------------------|-------------------|
//! | `echo`        | instant function    | `{text}`                     | `{text}`          |
//! | `spell`       | streaming function  | `{text}`                     | `{text: char}` each |
//! | `ticker`      | streaming function  | `{count, interval_ms?, fail_at?}` | `{tick: i}` each |
//! | `accumulator` | component type      | `{base?}`                    |                   |
//! | `tokenizer`   | component type      | `{vocab}` or `{vocab_path}`  |                   |
//!
//! `ticker` with `fail_at: n` yields ticks `0..n` and then fails.
//!
//! `accumulator` methods: `put {s}` → `{text}`, `get` → `{text}`,
//! `count` → `{count}`, streaming `replay {interval_ms?}` → `{s}` per put.
//!
//! `tokenizer` methods: `encode {text}` → `{tokens}` (greedy longest
//! match), `decode {tokens}` → `{text}`.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use futures_util::stream::{self, StreamExt};

use crate::error::{RuntimeError, ValidationError};
use crate::value::{from_json_str, Args, Value};
use crate::vm::{iter_stream, Component, ComponentBuilder, Module, ValueStream};

/// Module name.
pub const NAME: &str = "debug";

const MAX_TICKS: i64 = 10_000;
const MAX_TICK_INTERVAL_MS: i64 = 60_000;
const DEFAULT_TICK_INTERVAL_MS: i64 = 10;

/// Build the debug module.
pub fn module() -> Module {
    Module::new(NAME)
        .instant("echo", echo)
        .streaming("spell", spell)
        .streaming("ticker", ticker)
        .factory("accumulator", accumulator)
        .factory("tokenizer", tokenizer)
}

fn echo(args: Value) -> Result<Value, RuntimeError> {
    let text = Args::new("echo", &args)?.str("text")?;
    Ok([("text", text)].into_iter().collect())
}

fn spell(args: Value) -> Result<ValueStream, RuntimeError> {
    let text = Args::new("spell", &args)?.str("text")?;
    let letters: Vec<Value> = text
        .chars()
        .map(|c| [("text", Value::from(c))].into_iter().collect())
        .collect();
    Ok(iter_stream(letters))
}

fn ticker(args: Value) -> Result<ValueStream, RuntimeError> {
    let args = Args::new("ticker", &args)?;
    let count = args.int_in("count", 0..=MAX_TICKS)?;
    let interval = interval(&args, "ticker", DEFAULT_TICK_INTERVAL_MS)?;
    let fail_at = match args.opt_int("fail_at")? {
        Some(n) if n < 0 => {
            return Err(ValidationError::Range { op: "ticker".into(), field: "fail_at".into() }.into());
        }
        other => other,
    };

    let ticks = stream::unfold(0i64, move |tick| async move {
        if tick >= count {
            return None;
        }
        if tick > 0 {
            tokio::time::sleep(interval).await;
        }
        if fail_at == Some(tick) {
            let error = RuntimeError::operator(format!("ticker failed at tick {tick}"));
            return Some((Err(error), count));
        }
        let item: Value = [("tick", tick)].into_iter().collect();
        Some((Ok(item), tick + 1))
    });
    Ok(ticks.boxed())
}

/// Optional `interval_ms` field, bounded by `MAX_TICK_INTERVAL_MS`.
fn interval(args: &Args<'_>, op: &str, default_ms: i64) -> Result<Duration, RuntimeError> {
    let ms = match args.opt_int("interval_ms")? {
        None => default_ms,
        Some(ms) if (0..=MAX_TICK_INTERVAL_MS).contains(&ms) => ms,
        Some(_) => {
            return Err(ValidationError::Range { op: op.into(), field: "interval_ms".into() }.into());
        }
    };
    Ok(Duration::from_millis(ms.unsigned_abs()))
}

// ─── accumulator ───────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct Accumulator {
    base: String,
    chunks: Vec<String>,
}

impl Accumulator {
    fn text(&self) -> String {
        let mut text = self.base.clone();
        for chunk in &self.chunks {
            text.push_str(chunk);
        }
        text
    }
}

fn accumulator(args: Value) -> Result<Component, RuntimeError> {
    let base = Args::new("accumulator", &args)?.opt_str("base")?.unwrap_or_default();
    let state = Accumulator { base: base.to_string(), chunks: Vec::new() };

    Ok(ComponentBuilder::new(state)
        .instant("put", |acc: &mut Accumulator, args| {
            let s = Args::new("put", &args)?.str("s")?;
            acc.chunks.push(s.to_string());
            Ok([("text", acc.text())].into_iter().collect())
        })
        .instant("get", |acc: &mut Accumulator, _| {
            Ok([("text", acc.text())].into_iter().collect())
        })
        .instant("count", |acc: &mut Accumulator, _| {
            Ok([("count", acc.chunks.len() as i64)].into_iter().collect())
        })
        .streaming("replay", |acc: &mut Accumulator, args| {
            let pause = interval(&Args::new("replay", &args)?, "replay", 0)?;
            let items: Vec<Value> = acc
                .chunks
                .iter()
                .map(|s| [("s", s.as_str())].into_iter().collect())
                .collect();
            if pause.is_zero() {
                return Ok(iter_stream(items));
            }
            let paced = stream::iter(items).enumerate().then(move |(i, item)| async move {
                if i > 0 {
                    tokio::time::sleep(pause).await;
                }
                Ok::<Value, RuntimeError>(item)
            });
            Ok(paced.boxed())
        })
        .build())
}

// ─── tokenizer ─────────────────────────────────────────────────────────────

/// Greedy longest-match tokenizer over a fixed vocabulary.
#[derive(Debug, Default)]
struct Tokenizer {
    pieces: HashMap<String, i64>,
    ids: HashMap<i64, String>,
    longest: usize,
}

impl Tokenizer {
    fn from_vocab(vocab: &crate::value::Map) -> Result<Self, RuntimeError> {
        let mut tokenizer = Self::default();
        for (piece, id) in vocab {
            let id = id.as_i64().ok_or_else(|| ValidationError::Type {
                op: "tokenizer".into(),
                field: format!("vocab.{piece}"),
                expected: "int",
                actual: id.type_name(),
            })?;
            if piece.is_empty() {
                return Err(RuntimeError::operator("vocabulary contains an empty piece"));
            }
            if let Some(previous) = tokenizer.ids.insert(id, piece.clone()) {
                return Err(RuntimeError::operator(format!(
                    "token id {id} assigned to both {previous:?} and {piece:?}"
                )));
            }
            tokenizer.longest = tokenizer.longest.max(piece.len());
            tokenizer.pieces.insert(piece.clone(), id);
        }
        Ok(tokenizer)
    }

    fn from_file(path: &Path) -> Result<Self, RuntimeError> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            RuntimeError::operator(format!("failed to read vocabulary {}: {e}", path.display()))
        })?;
        let vocab = from_json_str(&text).map_err(|e| {
            RuntimeError::operator(format!("invalid vocabulary {}: {e}", path.display()))
        })?;
        match vocab.as_map() {
            Some(map) => Self::from_vocab(map),
            None => Err(RuntimeError::operator(format!(
                "vocabulary {} must be a JSON object",
                path.display()
            ))),
        }
    }

    fn encode(&self, text: &str) -> Result<Vec<i64>, RuntimeError> {
        let mut tokens = Vec::new();
        let mut rest = text;
        while !rest.is_empty() {
            let matched = (1..=self.longest.min(rest.len()))
                .rev()
                .filter(|&len| rest.is_char_boundary(len))
                .find_map(|len| self.pieces.get(&rest[..len]).map(|&id| (len, id)));
            let Some((len, id)) = matched else {
                let offset = text.len() - rest.len();
                return Err(RuntimeError::operator(format!(
                    "no vocabulary piece matches at byte {offset}"
                )));
            };
            tokens.push(id);
            rest = &rest[len..];
        }
        Ok(tokens)
    }

    fn decode(&self, tokens: &[Value]) -> Result<String, RuntimeError> {
        let mut text = String::new();
        for token in tokens {
            let id = token.as_i64().ok_or_else(|| ValidationError::Type {
                op: "decode".into(),
                field: "tokens".into(),
                expected: "int",
                actual: token.type_name(),
            })?;
            let piece = self
                .ids
                .get(&id)
                .ok_or_else(|| RuntimeError::operator(format!("unknown token id {id}")))?;
            text.push_str(piece);
        }
        Ok(text)
    }
}

fn tokenizer(args: Value) -> Result<Component, RuntimeError> {
    let args = Args::new("tokenizer", &args)?;
    let state = match (args.map().get("vocab"), args.opt_str("vocab_path")?) {
        (Some(_), _) => Tokenizer::from_vocab(args.map_field("vocab")?)?,
        (None, Some(path)) => Tokenizer::from_file(Path::new(path))?,
        (None, None) => {
            return Err(ValidationError::Range { op: "tokenizer".into(), field: "vocab".into() }.into());
        }
    };
    log::debug!("[Debug] Tokenizer loaded with {} pieces", state.pieces.len());

    Ok(ComponentBuilder::new(state)
        .instant("encode", |tok: &mut Tokenizer, args| {
            let text = Args::new("encode", &args)?.str("text")?;
            let tokens = tok.encode(text)?;
            Ok([("tokens", tokens)].into_iter().collect())
        })
        .instant("decode", |tok: &mut Tokenizer, args| {
            let tokens = Args::new("decode", &args)?.array("tokens")?;
            Ok([("text", tok.decode(tokens)?)].into_iter().collect())
        })
        .on_teardown(|tok: &mut Tokenizer| {
            tok.pieces.clear();
            tok.ids.clear();
        })
        .build())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vocab() -> Value {
        let pieces: Value = [
            ("What", 3838),
            (" is", 374),
            (" your", 697),
            (" name", 829),
            ("?", 30),
        ]
        .into_iter()
        .collect();
        [("vocab", pieces)].into_iter().collect()
    }

    fn loaded() -> Tokenizer {
        let args = vocab();
        Tokenizer::from_vocab(args.get("vocab").and_then(Value::as_map).unwrap()).unwrap()
    }

    #[test]
    fn test_encode_scenario_sentence() {
        let tokens = loaded().encode("What is your name?").unwrap();
        assert_eq!(tokens, vec![3838, 374, 697, 829, 30]);
    }

    #[test]
    fn test_decode_inverts_encode() {
        let tok = loaded();
        let tokens: Vec<Value> = [3838, 374, 697, 829, 30].into_iter().map(Value::from).collect();
        assert_eq!(tok.decode(&tokens).unwrap(), "What is your name?");
    }

    #[test]
    fn test_longest_match_wins() {
        let vocab: Value = [("a", 1), ("ab", 2), ("abc", 3), ("c", 4)].into_iter().collect();
        let tok = Tokenizer::from_vocab(vocab.as_map().unwrap()).unwrap();
        assert_eq!(tok.encode("abcab").unwrap(), vec![3, 2]);
        assert_eq!(tok.encode("ac").unwrap(), vec![1, 4]);
    }

    #[test]
    fn test_unencodable_text_is_operator_error() {
        let err = loaded().encode("Who?").unwrap_err();
        assert_eq!(err.code(), "OperatorError");
        assert!(err.to_string().contains("byte 0"));
    }

    #[test]
    fn test_decode_rejects_unknown_and_non_int_tokens() {
        let tok = loaded();
        assert_eq!(tok.decode(&[Value::from(1)]).unwrap_err().code(), "OperatorError");
        assert_eq!(tok.decode(&[Value::from("x")]).unwrap_err().code(), "TypeError");
    }

    #[test]
    fn test_tokenizer_requires_vocab() {
        assert_eq!(tokenizer(Value::Null).unwrap_err().code(), "RangeError");
        let missing: Value = [("vocab_path", "/nonexistent/vocab.json")].into_iter().collect();
        let err = tokenizer(missing).unwrap_err();
        assert_eq!(err.code(), "OperatorError");
        assert!(err.to_string().contains("failed to read vocabulary"));
    }

    #[test]
    fn test_tokenizer_loads_vocab_file() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("vocab.json");
        std::fs::write(&path, r#"{"hi": 1, "!": 2}"#).unwrap();
        let args: Value = [("vocab_path", path.to_str().unwrap())].into_iter().collect();
        let component = tokenizer(args).unwrap();
        assert_eq!(component.method_names().collect::<Vec<_>>(), vec!["encode", "decode"]);
    }

    #[test]
    fn test_echo_validates_text() {
        let ok = echo([("text", "hi")].into_iter().collect()).unwrap();
        assert_eq!(ok.get("text"), Some(&Value::from("hi")));
        let err = echo([("text", 5)].into_iter().collect()).unwrap_err();
        assert_eq!(err.code(), "TypeError");
        assert_eq!(echo(Value::Null).unwrap_err().code(), "RangeError");
    }

    #[tokio::test]
    async fn test_spell_streams_characters() {
        let args: Value = [("text", "héy")].into_iter().collect();
        let letters: Vec<Value> = spell(args)
            .unwrap()
            .map(|item| item.unwrap().get("text").cloned().unwrap())
            .collect()
            .await;
        assert_eq!(letters, vec![Value::from("h"), Value::from("é"), Value::from("y")]);
    }

    #[tokio::test]
    async fn test_ticker_counts() {
        let args: Value = [("count", 3), ("interval_ms", 0)].into_iter().collect();
        let ticks: Vec<i64> = ticker(args)
            .unwrap()
            .map(|item| item.unwrap().get("tick").and_then(Value::as_i64).unwrap())
            .collect()
            .await;
        assert_eq!(ticks, vec![0, 1, 2]);

        let too_many: Value = [("count", MAX_TICKS + 1)].into_iter().collect();
        assert_eq!(ticker(too_many).err().unwrap().code(), "RangeError");
    }

    #[tokio::test]
    async fn test_ticker_fails_at_requested_tick() {
        let args: Value = [("count", 10), ("interval_ms", 0), ("fail_at", 2)].into_iter().collect();
        let items: Vec<Result<Value, RuntimeError>> = ticker(args).unwrap().collect().await;
        assert_eq!(items.len(), 3);
        assert!(items[..2].iter().all(Result::is_ok));
        let err = items[2].as_ref().unwrap_err();
        assert_eq!(err.code(), "OperatorError");
        assert_eq!(err.to_string(), "ticker failed at tick 2");

        let negative: Value = [("count", 3), ("fail_at", -1)].into_iter().collect();
        assert_eq!(ticker(negative).err().unwrap().code(), "RangeError");
    }

    #[test]
    fn test_accumulator_methods_registered() {
        let component = accumulator([("base", "x")].into_iter().collect()).unwrap();
        let names: Vec<&str> = component.method_names().collect();
        assert_eq!(names, vec!["put", "get", "count", "replay"]);
    }
}
