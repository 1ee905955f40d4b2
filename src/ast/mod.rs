//! # Annotated abstract syntax tree
//!
//! The front end (lexer, parser and semantic checker) is an external
//! collaborator. It hands the compiler a fully resolved, type-annotated AST:
//! every expression carries its type, every identifier is unique within the
//! program (the checker renames shadowed names), member accesses are split
//! into an object expression plus a field name, and methods appear with their
//! mangled identifiers (`#Class#method`). The tree is exchanged as JSON,
//! which is what the `serde` derives below are for.
//!
//! AST nodes are tagged variants consumed by exhaustive `match` in the IR
//! builder; there is no visitor indirection.

use serde::{Deserialize, Serialize};

/// Resolved type of an expression or declaration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Type {
    /// 64-bit signed integer
    Int,
    /// Boolean (0 or 1 at the IR level)
    Bool,
    /// Immutable string instance
    Str,
    /// The type of the `null` literal
    Null,
    /// No value (function return position only)
    Void,
    /// Instance of a user-defined class
    Class(String),
    /// Array with the given element type
    Array(Box<Type>),
}

impl Type {
    /// Whether values of this type are passed by pointer to an instance
    pub fn is_reference(&self) -> bool {
        matches!(self, Type::Str | Type::Class(_) | Type::Array(_) | Type::Null)
    }
}

/// Unary operator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnaryOp {
    /// `-x`
    Neg,
    /// `~x`
    BitNot,
    /// `!x`
    LogicalNot,
    /// `++x` / `x++`
    Inc {
        /// True for the prefix form
        prefix: bool,
    },
    /// `--x` / `x--`
    Dec {
        /// True for the prefix form
        prefix: bool,
    },
}

/// Binary operator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BinaryOp {
    /// `=` (the left operand is an lvalue)
    Assign,
    /// `+` (integer addition or string concatenation, by operand type)
    Add,
    /// `-`
    Sub,
    /// `*`
    Mul,
    /// `/`
    Div,
    /// `%`
    Mod,
    /// `|`
    BitOr,
    /// `&`
    BitAnd,
    /// `^`
    Xor,
    /// `<<`
    Shl,
    /// `>>`
    Shr,
    /// `&&` (short-circuit)
    LogicalAnd,
    /// `||` (short-circuit)
    LogicalOr,
    /// `==`
    Eq,
    /// `!=`
    Ne,
    /// `<`
    Lt,
    /// `>`
    Gt,
    /// `<=`
    Le,
    /// `>=`
    Ge,
}

/// An expression together with its resolved type
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Expr {
    /// Type assigned by the semantic checker
    pub ty: Type,
    /// The expression payload
    pub kind: ExprKind,
}

/// Expression variants
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ExprKind {
    /// Integer literal
    IntLit(i64),
    /// Boolean literal
    BoolLit(bool),
    /// String literal (unescaped bytes)
    StrLit(String),
    /// The `null` literal
    NullLit,
    /// Resolved identifier; member variables referenced inside methods are
    /// already rewritten to `Member` on `this` by the checker
    Ident(String),
    /// `this` inside a method body
    This,
    /// Unary operation
    Unary {
        /// Operator
        op: UnaryOp,
        /// Operand
        operand: Box<Expr>,
    },
    /// Binary operation (including assignment and short-circuit operators)
    Binary {
        /// Operator
        op: BinaryOp,
        /// Left operand
        lhs: Box<Expr>,
        /// Right operand
        rhs: Box<Expr>,
    },
    /// Call to a free function, a method (mangled name plus receiver), or a
    /// runtime builtin
    Call {
        /// Callee identifier, mangled for methods
        func: String,
        /// Receiver for method calls
        receiver: Option<Box<Expr>>,
        /// Argument expressions
        args: Vec<Expr>,
    },
    /// `array[index]`
    Index {
        /// Array expression
        array: Box<Expr>,
        /// Index expression
        index: Box<Expr>,
    },
    /// `object.field`
    Member {
        /// Object expression (class-typed)
        object: Box<Expr>,
        /// Field name
        field: String,
    },
    /// `new T` or `new T[n][m]...[]...`
    New {
        /// The type being created (the full array type for array news)
        ty: Type,
        /// Provided dimension sizes, outermost first; trailing dimensions may
        /// be omitted
        dims: Vec<Expr>,
    },
}

/// Statement variants
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Stmt {
    /// Local variable declaration
    VarDecl {
        /// Unique variable name
        name: String,
        /// Declared type
        ty: Type,
        /// Optional initializer
        init: Option<Expr>,
    },
    /// Expression evaluated for effect
    Expr(Expr),
    /// Two-way conditional
    If {
        /// Condition (bool-typed)
        cond: Expr,
        /// Then branch
        then_stmt: Box<Stmt>,
        /// Optional else branch
        else_stmt: Option<Box<Stmt>>,
    },
    /// While loop
    While {
        /// Condition (bool-typed)
        cond: Expr,
        /// Body
        body: Box<Stmt>,
    },
    /// For loop; any of the three positions may be absent
    For {
        /// Initializer statement
        init: Option<Box<Stmt>>,
        /// Condition
        cond: Option<Expr>,
        /// Update expression
        update: Option<Expr>,
        /// Body
        body: Box<Stmt>,
    },
    /// Return, with optional value
    Return(Option<Expr>),
    /// Break out of the innermost loop
    Break,
    /// Continue with the innermost loop's update
    Continue,
    /// Braced statement list
    Block(Vec<Stmt>),
    /// Empty statement
    Empty,
}

/// A function or method definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FuncDecl {
    /// Identifier; methods carry their mangled `#Class#name` form
    pub name: String,
    /// Parameters (unique names, declared types)
    pub params: Vec<(String, Type)>,
    /// Return type
    pub ret: Type,
    /// Body statements
    pub body: Vec<Stmt>,
    /// Set on methods; names the receiver class
    pub receiver: Option<String>,
}

/// A class definition: fields in declaration order plus methods
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassDecl {
    /// Class name
    pub name: String,
    /// Fields in declaration order (each occupies one 8-byte slot)
    pub fields: Vec<(String, Type)>,
    /// Methods (also present in [`Program::funcs`] order is irrelevant)
    pub methods: Vec<FuncDecl>,
}

/// A global variable declaration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobalDecl {
    /// Unique name
    pub name: String,
    /// Declared type
    pub ty: Type,
    /// Optional initializer, evaluated before `main` runs
    pub init: Option<Expr>,
}

/// A complete annotated program
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Program {
    /// Class definitions
    pub classes: Vec<ClassDecl>,
    /// Global variable declarations
    pub globals: Vec<GlobalDecl>,
    /// Free functions (methods live in their classes)
    pub funcs: Vec<FuncDecl>,
}

impl Program {
    /// Decode a program from its JSON interchange form
    pub fn from_json(text: &str) -> crate::Result<Self> {
        serde_json::from_str(text).map_err(|e| crate::Error::AstDecode(e.to_string()))
    }
}
