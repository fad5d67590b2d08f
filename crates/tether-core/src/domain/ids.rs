//! Domain identifiers (strongly-typed names).
//!
//! # Phantom Type パターン
//! 識別子はすべて外部（construct 層・cloud bridge・worker プロセス）から文字列で届くため、
//! 中身は `String` のまま、`T` をマーカー型としてコンパイル時にだけ区別します。
//!
//! - `FunctionId`: construct 層が宣言した関数の ID
//! - `WorkerId`: cloud 側の実行環境 1 つに対応する不透明な ID
//! - `RequestId`: 1 回の invocation の ID（ローカルで生成する場合は ULID）

use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use std::fmt;
use std::marker::PhantomData;
use ulid::Ulid;

/// NameMarker は各 ID 型のマーカー trait
pub trait NameMarker: Send + Sync + 'static {
    /// Debug 出力で使うラベル（例: "function", "worker"）
    fn label() -> &'static str;
}

/// ジェネリック ID 型
///
/// ```ignore
/// let f = FunctionId::new("api-handler");
/// let w = WorkerId::new("api-handler");
/// // f と w は同じ文字列でも異なる型なので、混同できない
/// ```
#[derive(Serialize, Deserialize)]
#[serde(transparent)]
pub struct Name<T: NameMarker> {
    value: String,
    #[serde(skip)]
    _marker: PhantomData<fn() -> T>,
}

impl<T: NameMarker> Name<T> {
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            _marker: PhantomData,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.value
    }
}

// derive だと `T: Clone` などを要求してしまうので手で実装する
impl<T: NameMarker> Clone for Name<T> {
    fn clone(&self) -> Self {
        Self::new(self.value.clone())
    }
}

impl<T: NameMarker> PartialEq for Name<T> {
    fn eq(&self, other: &Self) -> bool {
        self.value == other.value
    }
}

impl<T: NameMarker> Eq for Name<T> {}

impl<T: NameMarker> std::hash::Hash for Name<T> {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.value.hash(state);
    }
}

impl<T: NameMarker> PartialOrd for Name<T> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl<T: NameMarker> Ord for Name<T> {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.value.cmp(&other.value)
    }
}

impl<T: NameMarker> fmt::Debug for Name<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", T::label(), self.value)
    }
}

impl<T: NameMarker> fmt::Display for Name<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.value)
    }
}

impl<T: NameMarker> From<&str> for Name<T> {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl<T: NameMarker> From<String> for Name<T> {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

impl<T: NameMarker> Borrow<str> for Name<T> {
    fn borrow(&self) -> &str {
        &self.value
    }
}

// ========================================
// マーカー型の定義
// ========================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Function {}

impl NameMarker for Function {
    fn label() -> &'static str {
        "function"
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Worker {}

impl NameMarker for Worker {
    fn label() -> &'static str {
        "worker"
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Request {}

impl NameMarker for Request {
    fn label() -> &'static str {
        "request"
    }
}

/// Identifier of a declared function.
pub type FunctionId = Name<Function>;

/// Identifier of a live local worker (one cloud execution environment).
pub type WorkerId = Name<Worker>;

/// Identifier of one invocation.
pub type RequestId = Name<Request>;

impl RequestId {
    /// Fresh request id for invocations that originate locally.
    pub fn generate() -> Self {
        Self::new(Ulid::new().to_string().to_lowercase())
    }
}
