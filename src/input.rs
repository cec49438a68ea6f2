//! Input program parsing (spec.md §6): the JSON `{code, pretty}`
//! format, each `code` entry a list whose first element names the
//! opcode and the rest are its operands.

use serde_json::Value as Json;

use crate::error::InputError;
use crate::vmcode::{Address, Const, Instr, InvariantDecl, NaryOp, Program};

pub fn load(path: &str) -> Result<Program, InputError> {
    let text = std::fs::read_to_string(path).map_err(|source| InputError::Read {
        path: path.to_string(),
        source,
    })?;
    parse(&text)
}

pub fn parse(text: &str) -> Result<Program, InputError> {
    let doc: Json = serde_json::from_str(text)?;
    let code_arr = doc
        .get("code")
        .and_then(Json::as_array)
        .cloned()
        .unwrap_or_default();
    let pretty_arr: Vec<String> = doc
        .get("pretty")
        .and_then(Json::as_array)
        .map(|a| a.iter().map(json_to_pretty_string).collect())
        .unwrap_or_default();

    if !pretty_arr.is_empty() && pretty_arr.len() != code_arr.len() {
        return Err(InputError::LengthMismatch { code: code_arr.len(), pretty: pretty_arr.len() });
    }

    let mut code = Vec::with_capacity(code_arr.len());
    for (index, entry) in code_arr.iter().enumerate() {
        code.push(parse_instr(index, entry)?);
    }

    let invariants = doc
        .get("invariants")
        .and_then(Json::as_array)
        .map(|arr| {
            arr.iter()
                .filter_map(|v| {
                    let pc = v.get("pc")?.as_u64()? as usize;
                    let uses_pre = v.get("uses_pre").and_then(Json::as_bool).unwrap_or(false);
                    Some(InvariantDecl { pc, uses_pre })
                })
                .collect()
        })
        .unwrap_or_default();

    let entry_pc = doc.get("entry").and_then(Json::as_u64).unwrap_or(0) as usize;

    let pretty = if pretty_arr.is_empty() {
        (0..code.len()).map(|i| format!("pc {i}")).collect()
    } else {
        pretty_arr
    };

    Ok(Program { code, pretty, invariants, entry_pc })
}

fn json_to_pretty_string(v: &Json) -> String {
    v.as_str().map(str::to_string).unwrap_or_else(|| v.to_string())
}

fn parse_instr(index: usize, entry: &Json) -> Result<Instr, InputError> {
    let items = entry.as_array().ok_or_else(|| InputError::BadOperand {
        index,
        opcode: entry.to_string(),
        reason: "instruction must be a JSON array".to_string(),
    })?;
    let opcode = items
        .first()
        .and_then(Json::as_str)
        .ok_or(InputError::MissingOpcode { index })?;

    let arg = |n: usize| items.get(n + 1);
    let bad = |reason: &str| InputError::BadOperand { index, opcode: opcode.to_string(), reason: reason.to_string() };
    let string_arg = |n: usize, reason: &str| -> Result<String, InputError> {
        arg(n).and_then(Json::as_str).map(str::to_string).ok_or_else(|| bad(reason))
    };
    let usize_arg = |n: usize, reason: &str| -> Result<usize, InputError> {
        arg(n).and_then(Json::as_u64).map(|v| v as usize).ok_or_else(|| bad(reason))
    };

    let instr = match opcode {
        "PushBool" => Instr::Push(Const::Bool(arg(0).and_then(Json::as_bool).ok_or_else(|| bad("expected a bool"))?)),
        "PushInt" => Instr::Push(Const::Int(arg(0).and_then(Json::as_i64).ok_or_else(|| bad("expected an int"))?)),
        "PushAtom" => Instr::Push(Const::Atom(string_arg(0, "expected a string")?)),
        "LoadGlobal" => Instr::Load(Address::Global(string_arg(0, "expected a variable name")?)),
        "LoadLocal" => Instr::Load(Address::Local(usize_arg(0, "expected a slot index")?)),
        "StoreGlobal" => Instr::Store(Address::Global(string_arg(0, "expected a variable name")?)),
        "StoreLocal" => Instr::Store(Address::Local(usize_arg(0, "expected a slot index")?)),
        "DelGlobal" => Instr::Del(Address::Global(string_arg(0, "expected a variable name")?)),
        "Dup" => Instr::Dup,
        "Pop" => Instr::Pop,
        "Add" => Instr::Nary(NaryOp::Add),
        "Sub" => Instr::Nary(NaryOp::Sub),
        "Mul" => Instr::Nary(NaryOp::Mul),
        "Eq" => Instr::Nary(NaryOp::Eq),
        "Ne" => Instr::Nary(NaryOp::Ne),
        "Lt" => Instr::Nary(NaryOp::Lt),
        "Le" => Instr::Nary(NaryOp::Le),
        "Gt" => Instr::Nary(NaryOp::Gt),
        "Ge" => Instr::Nary(NaryOp::Ge),
        "And" => Instr::Nary(NaryOp::And),
        "Or" => Instr::Nary(NaryOp::Or),
        "Not" => Instr::Nary(NaryOp::Not),
        "Choose" => Instr::Choose,
        "AtomicInc" => Instr::AtomicInc,
        "AtomicDec" => Instr::AtomicDec,
        "ReadonlyInc" => Instr::ReadonlyInc,
        "ReadonlyDec" => Instr::ReadonlyDec,
        "Print" => Instr::Print,
        "Spawn" => Instr::Spawn { pc: usize_arg(0, "expected a target pc")? },
        "SetIntLevel" => Instr::SetIntLevel(arg(0).and_then(Json::as_bool).ok_or_else(|| bad("expected a bool"))?),
        "Jump" => Instr::Jump(usize_arg(0, "expected a target pc")?),
        "JumpCond" => Instr::JumpCond(usize_arg(0, "expected a target pc")?),
        "Assert" => Instr::Assert { reason: string_arg(0, "expected a failure message").unwrap_or_default() },
        "Return" => Instr::Return,
        "Stop" => Instr::Stop,
        "Nop" => Instr::Nop,
        other => {
            return Err(InputError::UnknownOpcode { index, opcode: other.to_string() });
        }
    };
    Ok(instr)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_minimal_program() {
        let json = r#"{
            "code": [["PushInt", 1], ["Print"], ["Return"]],
            "pretty": ["push 1", "print", "return"]
        }"#;
        let program = parse(json).unwrap();
        assert_eq!(program.code.len(), 3);
        assert_eq!(program.code[0], Instr::Push(Const::Int(1)));
        assert_eq!(program.pretty[1], "print");
    }

    #[test]
    fn rejects_unknown_opcode() {
        let json = r#"{"code": [["Frobnicate"]], "pretty": ["?"]}"#;
        let err = parse(json).unwrap_err();
        assert!(matches!(err, InputError::UnknownOpcode { .. }));
    }

    #[test]
    fn rejects_mismatched_pretty_length() {
        let json = r#"{"code": [["Return"], ["Return"]], "pretty": ["only one"]}"#;
        let err = parse(json).unwrap_err();
        assert!(matches!(err, InputError::LengthMismatch { .. }));
    }
}
