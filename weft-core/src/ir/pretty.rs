//! Textual rendering of the IR.
//!
//! Names print as `hint_id` when a binder carries a hint, so output can be
//! read against the input program.

use std::collections::HashMap;
use std::fmt::Write;

use super::{
    BinOp, Body, CmpOp, DimIndex, Exp, ExtSize, ExtType, FunDef, GroupOp, Kernel, KernelResult, Lambda,
    LoopForm, Op, Pat, PrimType, PrimValue, Program, SizeOp, Soac, Stm, StreamForm, SubExp, Type, UnOp,
    VarId,
};

pub fn pretty_program(program: &Program) -> String {
    let mut out = String::new();
    for (i, fun) in program.funs.iter().enumerate() {
        if i > 0 {
            out.push('\n');
        }
        out.push_str(&pretty_fun(fun));
    }
    out
}

pub fn pretty_fun(fun: &FunDef) -> String {
    let mut hints = HashMap::new();
    for p in &fun.params {
        hints.insert(p.var, p.name_hint.clone());
    }
    collect_hints(&fun.body.stms, &mut hints);

    let mut p = Printer {
        hints,
        out: String::new(),
        indent: 0,
    };
    let params: Vec<String> = fun
        .params
        .iter()
        .map(|prm| format!("{}: {}", p.name(prm.var), p.ty(&prm.ty)))
        .collect();
    let ret: Vec<String> = fun.ret.iter().map(|t| p.ext_ty(t)).collect();
    let _ = writeln!(p.out, "fun {}({}): ({}) =", fun.name, params.join(", "), ret.join(", "));
    p.indent += 1;
    p.body(&fun.body);
    p.out
}

fn collect_hints(stms: &[Stm], hints: &mut HashMap<VarId, String>) {
    for stm in stms {
        for pe in stm.pat.elems() {
            hints.insert(pe.var, pe.name_hint.clone());
        }
        match &stm.exp {
            Exp::If {
                then_body,
                else_body,
                ..
            } => {
                collect_hints(&then_body.stms, hints);
                collect_hints(&else_body.stms, hints);
            }
            Exp::Loop { merge, body, .. } => {
                for (p, _) in merge {
                    hints.insert(p.var, p.name_hint.clone());
                }
                collect_hints(&body.stms, hints);
            }
            Exp::Op(Op::Soac(soac)) => {
                for lam in soac.lambdas() {
                    collect_hints_lambda(lam, hints);
                }
            }
            Exp::Op(Op::Group(op)) => {
                for lam in group_lambdas(op) {
                    collect_hints_lambda(lam, hints);
                }
            }
            Exp::Op(Op::Kernel(k)) => {
                for inp in &k.inputs {
                    hints.insert(inp.param.var, inp.param.name_hint.clone());
                }
                collect_hints(&k.body.stms, hints);
            }
            _ => {}
        }
    }
}

fn collect_hints_lambda(lam: &Lambda, hints: &mut HashMap<VarId, String>) {
    for p in &lam.params {
        hints.insert(p.var, p.name_hint.clone());
    }
    collect_hints(&lam.body.stms, hints);
}

fn group_lambdas(op: &GroupOp) -> Vec<&Lambda> {
    match op {
        GroupOp::Map(m) => vec![&m.lam],
        GroupOp::Reduce(r) => vec![&r.lam],
        GroupOp::Scan(s) => vec![&s.lam],
        GroupOp::Stream(s) => match &s.form {
            StreamForm::Sequential => vec![&s.lam],
            StreamForm::Parallel { red_lam, .. } => vec![&s.lam, red_lam],
        },
    }
}

struct Printer {
    hints: HashMap<VarId, String>,
    out: String,
    indent: usize,
}

impl Printer {
    fn name(&self, v: VarId) -> String {
        match self.hints.get(&v) {
            Some(h) if !h.is_empty() => format!("{h}_{}", v.0),
            _ => v.to_string(),
        }
    }

    fn se(&self, se: &SubExp) -> String {
        match se {
            SubExp::Var(v) => self.name(*v),
            SubExp::Const(c) => prim_value(c),
        }
    }

    fn ses(&self, ses: &[SubExp]) -> String {
        ses.iter().map(|se| self.se(se)).collect::<Vec<_>>().join(", ")
    }

    fn names(&self, vs: &[VarId]) -> String {
        vs.iter().map(|v| self.name(*v)).collect::<Vec<_>>().join(", ")
    }

    fn ty(&self, t: &Type) -> String {
        let dims: String = t.dims().iter().map(|d| format!("[{}]", self.se(d))).collect();
        format!("{dims}{}", prim_type(t.elem_type()))
    }

    fn ext_ty(&self, t: &ExtType) -> String {
        match t {
            ExtType::Prim(p) => prim_type(*p).to_string(),
            ExtType::Array { elem, shape } => {
                let dims: String = shape
                    .iter()
                    .map(|d| match d {
                        ExtSize::Free(se) => format!("[{}]", self.se(se)),
                        ExtSize::Ext(i) => format!("[?{i}]"),
                    })
                    .collect();
                format!("{dims}{}", prim_type(*elem))
            }
        }
    }

    fn slice(&self, slice: &[DimIndex]) -> String {
        slice
            .iter()
            .map(|d| match d {
                DimIndex::Fix(i) => self.se(i),
                DimIndex::Slice { start, len, stride } => {
                    format!("{}:+{}*{}", self.se(start), self.se(len), self.se(stride))
                }
            })
            .collect::<Vec<_>>()
            .join(", ")
    }

    fn line(&mut self, s: &str) {
        for _ in 0..self.indent {
            self.out.push_str("  ");
        }
        self.out.push_str(s);
        self.out.push('\n');
    }

    fn pat(&self, pat: &Pat) -> String {
        let elems: Vec<String> = pat
            .elems()
            .map(|pe| format!("{}: {}", self.name(pe.var), self.ty(&pe.ty)))
            .collect();
        if pat.ctx.is_empty() {
            elems.join(", ")
        } else {
            let (ctx, vals) = elems.split_at(pat.ctx.len());
            format!("<{}> {}", ctx.join(", "), vals.join(", "))
        }
    }

    fn body(&mut self, body: &Body) {
        for stm in &body.stms {
            self.stm(stm);
        }
        let res = format!("in {{{}}}", self.ses(&body.result));
        self.line(&res);
    }

    fn stm(&mut self, stm: &Stm) {
        let certs = if stm.certs.0.is_empty() {
            String::new()
        } else {
            format!("#{{{}}} ", self.names(&stm.certs.0))
        };
        let head = format!("let {} = {certs}", self.pat(&stm.pat));
        self.exp(head, &stm.exp);
    }

    fn lambda(&mut self, lam: &Lambda) {
        let params: Vec<String> = lam
            .params
            .iter()
            .map(|p| format!("{}: {}", self.name(p.var), self.ty(&p.ty)))
            .collect();
        let ret: Vec<String> = lam.ret.iter().map(|t| self.ty(t)).collect();
        let head = format!("\\{} : ({}) ->", params.join(" "), ret.join(", "));
        self.line(&head);
        self.indent += 1;
        self.body(&lam.body);
        self.indent -= 1;
    }

    fn soac(&mut self, head: String, name: &str, w: &SubExp, args: String, lams: Vec<&Lambda>) {
        let line = format!("{head}{name}({}, {args})", self.se(w));
        self.line(&line);
        self.indent += 1;
        for lam in lams {
            self.lambda(lam);
        }
        self.indent -= 1;
    }

    fn exp(&mut self, head: String, exp: &Exp) {
        let simple = match exp {
            Exp::SubExp(se) => self.se(se),
            Exp::BinOp(op, x, y) => format!("{}({}, {})", binop(*op), self.se(x), self.se(y)),
            Exp::CmpOp(op, x, y) => format!("{}({}, {})", cmpop(*op), self.se(x), self.se(y)),
            Exp::UnOp(op, x) => format!("{}({})", unop(*op), self.se(x)),
            Exp::Convert(t, x) => format!("{}({})", prim_type(*t), self.se(x)),
            Exp::Index { arr, slice } => format!("{}[{}]", self.name(*arr), self.slice(slice)),
            Exp::Update { arr, slice, value } => format!(
                "{} with [{}] = {}",
                self.name(*arr),
                self.slice(slice),
                self.se(value)
            ),
            Exp::Iota { n } => format!("iota({})", self.se(n)),
            Exp::Replicate { shape, value } => {
                format!("replicate([{}], {})", self.ses(shape.dims()), self.se(value))
            }
            Exp::Scratch { elem, shape } => format!("scratch({}, [{}])", prim_type(*elem), self.ses(shape.dims())),
            Exp::Rearrange { perm, arr } => format!("rearrange({perm:?}, {})", self.name(*arr)),
            Exp::Reshape { shape, arr } => format!("reshape([{}], {})", self.ses(shape.dims()), self.name(*arr)),
            Exp::Manifest { perm, arr } => format!("manifest({perm:?}, {})", self.name(*arr)),
            Exp::Copy(arr) => format!("copy({})", self.name(*arr)),
            Exp::Concat { dim, arrs, w } => format!("concat@{dim}({}; {})", self.names(arrs), self.se(w)),
            Exp::Apply { fun, args, .. } => format!("{fun}({})", self.ses(args)),
            Exp::Op(Op::Size(SizeOp::GetSize { name, class })) => format!("get_size({name}, {class})"),
            Exp::Op(Op::Size(SizeOp::CmpSizeLe { name, class, x })) => {
                format!("cmp_size({name}, {class}) <= {}", self.se(x))
            }
            _ => String::new(),
        };
        if !simple.is_empty() {
            self.line(&format!("{head}{simple}"));
            return;
        }
        match exp {
            Exp::If {
                cond,
                then_body,
                else_body,
                ret,
            } => {
                let ret: Vec<String> = ret.iter().map(|t| self.ext_ty(t)).collect();
                self.line(&format!("{head}if {} : ({}) then", self.se(cond), ret.join(", ")));
                self.indent += 1;
                self.body(then_body);
                self.indent -= 1;
                self.line("else");
                self.indent += 1;
                self.body(else_body);
                self.indent -= 1;
            }
            Exp::Loop { merge, form, body } => {
                let merge: Vec<String> = merge
                    .iter()
                    .map(|(p, init)| format!("{}: {} = {}", self.name(p.var), self.ty(&p.ty), self.se(init)))
                    .collect();
                let form = match form {
                    LoopForm::For { i, bound } => format!("for {} < {}", self.name(*i), self.se(bound)),
                    LoopForm::While { cond } => format!("while {}", self.name(*cond)),
                };
                self.line(&format!("{head}loop ({}) {form} do", merge.join(", ")));
                self.indent += 1;
                self.body(body);
                self.indent -= 1;
            }
            Exp::Op(Op::Soac(soac)) => self.soac_exp(head, soac, ""),
            Exp::Op(Op::Group(op)) => {
                let soac = super::builder::group_as_soac(op);
                self.soac_exp(head, &soac, "group_");
            }
            Exp::Op(Op::Kernel(k)) => self.kernel(head, k),
            _ => {}
        }
    }

    fn soac_exp(&mut self, head: String, soac: &Soac, prefix: &str) {
        let name = format!("{prefix}{}", soac.name());
        let (args, lams): (String, Vec<&Lambda>) = match soac {
            Soac::Map(m) => (self.names(&m.arrs), vec![&m.lam]),
            Soac::Reduce(r) => (
                format!("{{{}}}, {}", self.ses(&r.nes), self.names(&r.arrs)),
                vec![&r.lam],
            ),
            Soac::Scan(s) => (
                format!("{{{}}}, {}", self.ses(&s.nes), self.names(&s.arrs)),
                vec![&s.lam],
            ),
            Soac::Redomap(r) => (
                format!("{{{}}}, {}", self.ses(&r.nes), self.names(&r.arrs)),
                vec![&r.red_lam, &r.map_lam],
            ),
            Soac::Scanomap(s) => (
                format!("{{{}}}, {}", self.ses(&s.nes), self.names(&s.arrs)),
                vec![&s.scan_lam, &s.map_lam],
            ),
            Soac::Stream(s) => {
                let form = match &s.form {
                    StreamForm::Sequential => "seq",
                    StreamForm::Parallel { .. } => "par",
                };
                (
                    format!("{form}, {{{}}}, {}", self.ses(&s.accs), self.names(&s.arrs)),
                    soac.lambdas(),
                )
            }
            Soac::Scatter(s) => {
                let dests: Vec<String> = s
                    .dests
                    .iter()
                    .map(|(w, d)| format!("({}, {})", self.se(w), self.name(*d)))
                    .collect();
                (format!("{}, {}", self.names(&s.arrs), dests.join(", ")), vec![&s.lam])
            }
            Soac::WithLoop(wl) => {
                let dests: Vec<String> = wl
                    .dests
                    .iter()
                    .map(|(w, d)| format!("({}, {})", self.se(w), self.name(*d)))
                    .collect();
                (format!("from {}, {}", self.se(&wl.offset), dests.join(", ")), vec![&wl.lam])
            }
        };
        self.soac(head, &name, soac.width(), args, lams);
    }

    fn kernel(&mut self, head: String, k: &Kernel) {
        let level = match k.space.level {
            super::SegLevel::Thread => "thread",
            super::SegLevel::Group => "group",
        };
        let dims: Vec<String> = k
            .space
            .dims
            .iter()
            .map(|(v, w)| format!("{} < {}", self.name(*v), self.se(w)))
            .collect();
        let line = format!(
            "{head}kernel<{level}> \"{}\" (gtid {}; groups {} x {}) ({}) {{",
            k.desc,
            self.name(k.space.global_tid),
            self.se(&k.space.num_groups),
            self.se(&k.space.group_size),
            dims.join(", ")
        );
        self.line(&line);
        self.indent += 1;
        for inp in &k.inputs {
            let l = format!(
                "input {}: {} = {}[{}]",
                self.name(inp.param.var),
                self.ty(&inp.param.ty),
                self.name(inp.arr),
                self.ses(&inp.indices)
            );
            self.line(&l);
        }
        for stm in &k.body.stms {
            self.stm(stm);
        }
        for (r, t) in k.body.results.iter().zip(&k.ret) {
            let l = match r {
                KernelResult::Threads(se) => format!("return {}: {}", self.se(se), self.ty(t)),
                KernelResult::Write {
                    dest_w,
                    dest,
                    index,
                    value,
                } => format!(
                    "write {}[{}] = {} (size {})",
                    self.name(*dest),
                    self.se(index),
                    self.se(value),
                    self.se(dest_w)
                ),
            };
            self.line(&l);
        }
        self.indent -= 1;
        self.line("}");
    }
}

fn prim_type(t: PrimType) -> &'static str {
    match t {
        PrimType::Bool => "bool",
        PrimType::I32 => "i32",
        PrimType::I64 => "i64",
        PrimType::F32 => "f32",
        PrimType::F64 => "f64",
    }
}

fn prim_value(v: &PrimValue) -> String {
    match v {
        PrimValue::Bool(b) => b.to_string(),
        PrimValue::I32(x) => format!("{x}i32"),
        PrimValue::I64(x) => format!("{x}i64"),
        PrimValue::F32(x) => format!("{x}f32"),
        PrimValue::F64(x) => format!("{x}f64"),
    }
}

fn binop(op: BinOp) -> &'static str {
    match op {
        BinOp::Add => "add",
        BinOp::Sub => "sub",
        BinOp::Mul => "mul",
        BinOp::Div => "div",
        BinOp::Mod => "mod",
        BinOp::Min => "min",
        BinOp::Max => "max",
        BinOp::And => "and",
        BinOp::Or => "or",
    }
}

fn cmpop(op: CmpOp) -> &'static str {
    match op {
        CmpOp::Eq => "eq",
        CmpOp::Ne => "ne",
        CmpOp::Lt => "lt",
        CmpOp::Le => "le",
    }
}

fn unop(op: UnOp) -> &'static str {
    match op {
        UnOp::Not => "not",
        UnOp::Neg => "neg",
        UnOp::Abs => "abs",
    }
}

impl std::fmt::Display for Program {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&pretty_program(self))
    }
}
