//! The abstract syntax tree shape the code generator consumes.
//!
//! Lexing and parsing are out of scope for this crate; a front end
//! constructs these types directly (or a parser crate downstream of this
//! one does). Nothing here executes — [`crate::codegen::Generator`] is the
//! only consumer.

/// A type annotation as written in source. The generator only uses these to
/// pick default struct-field values and is otherwise permissive about
/// mismatches — Phasor is dynamically typed at runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TypeNode {
    /// `int`
    Int,
    /// `float`
    Float,
    /// `bool`
    Bool,
    /// `string`
    String,
    /// A named struct type.
    Named(String),
}

/// A function parameter: its name and declared type.
#[derive(Debug, Clone, PartialEq)]
pub struct Param {
    /// Parameter name.
    pub name: String,
    /// Declared type.
    pub ty: TypeNode,
}

/// A named field in a struct declaration.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldDecl {
    /// Field name.
    pub name: String,
    /// Declared type.
    pub ty: TypeNode,
}

/// A `case value: body` arm within a `switch`.
#[derive(Debug, Clone, PartialEq)]
pub struct SwitchCase {
    /// The value this case matches, compared with `==`.
    pub value: Expr,
    /// Statements to run when this case matches.
    pub body: Vec<Stmt>,
}

/// A unary operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    /// `-x`
    Neg,
    /// `!x`
    Not,
    /// `&x`
    Ref,
    /// `*x`
    Deref,
}

/// A postfix increment/decrement operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PostfixOp {
    /// `x++`
    Inc,
    /// `x--`
    Dec,
}

/// A binary operator. `And`/`Or` short-circuit; the rest are strict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    /// `+`
    Add,
    /// `-`
    Sub,
    /// `*`
    Mul,
    /// `/`
    Div,
    /// `%`
    Mod,
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
    /// `&&`
    And,
    /// `||`
    Or,
}

/// A numeric or string literal, member access, call, or any other
/// expression form the generator lowers.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// A number literal, kept in its original text form so the generator
    /// decides whether it folds to `Int` or `Float`.
    Number(String),
    /// A string literal (already unescaped).
    Str(String),
    /// An identifier reference.
    Ident(String),
    /// `true` / `false`.
    Bool(bool),
    /// `null`.
    Null,
    /// A unary expression.
    Unary(UnaryOp, Box<Expr>),
    /// A postfix `++`/`--` on an lvalue expression.
    Postfix(Box<Expr>, PostfixOp),
    /// A binary expression.
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
    /// A call by callee name (member-access calls are rewritten upstream to
    /// pass the receiver as the first argument).
    Call(String, Vec<Expr>),
    /// `arr[index]`.
    ArrayAccess(Box<Expr>, Box<Expr>),
    /// `[a, b, c]`.
    ArrayLiteral(Vec<Expr>),
    /// `obj.field`.
    FieldAccess(Box<Expr>, String),
    /// `StructName { field: value, ... }`.
    StructInstance(String, Vec<(String, Expr)>),
    /// `lvalue = value`.
    Assign(Box<Expr>, Box<Expr>),
}

/// A statement.
#[derive(Debug, Clone, PartialEq)]
pub enum Stmt {
    /// `var name = init;` (init is optional).
    VarDecl(String, Option<Expr>),
    /// An expression evaluated for its side effect; the result is
    /// discarded.
    ExprStmt(Expr),
    /// `print expr;`
    Print(Expr),
    /// `import "path";`
    Import(String),
    /// `export <decl>` — wraps an inner declaration, marking it exported.
    Export(Box<Stmt>),
    /// `{ ... }`
    Block(Vec<Stmt>),
    /// `if (cond) then [else else_]`.
    If { cond: Expr, then: Vec<Stmt>, else_: Option<Vec<Stmt>> },
    /// `while (cond) body`.
    While { cond: Expr, body: Vec<Stmt> },
    /// `for (init; cond; incr) body`.
    For {
        /// Executed once before the loop; typically a `VarDecl`.
        init: Option<Box<Stmt>>,
        /// Re-checked before every iteration; absence means always-true.
        cond: Option<Expr>,
        /// Executed after every iteration.
        incr: Option<Expr>,
        /// Loop body.
        body: Vec<Stmt>,
    },
    /// `switch (value) { cases... default }`.
    Switch { value: Expr, cases: Vec<SwitchCase>, default: Option<Vec<Stmt>> },
    /// `return [value];`
    Return(Option<Expr>),
    /// `break;`
    Break,
    /// `continue;`
    Continue,
    /// `unsafe { ... }` — has no runtime effect; the generator lowers its
    /// body as an ordinary block.
    UnsafeBlock(Vec<Stmt>),
    /// `fn name(params) -> ret { body }`.
    FunctionDecl {
        /// Function name.
        name: String,
        /// Declared parameters, in call order.
        params: Vec<Param>,
        /// Declared return type, if written.
        ret: Option<TypeNode>,
        /// Function body.
        body: Vec<Stmt>,
    },
    /// `struct Name { fields... }`.
    StructDecl {
        /// Struct name.
        name: String,
        /// Declared fields, in declaration order.
        fields: Vec<FieldDecl>,
    },
}

/// A whole compilation unit: an ordered sequence of top-level statements.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Program {
    /// Top-level statements, in source order.
    pub statements: Vec<Stmt>,
}
