//! Integer arithmetic service used by the `wzrpc` binary.

use serde::{Deserialize, Serialize};

use crate::rpc::{Codec, MethodSet, Service};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Arith;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Number {
    pub value: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operands {
    pub a: i64,
    pub b: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Quotient {
    pub quotient: i64,
    pub remainder: i64,
}

impl Arith {
    pub fn double(&self, args: Number, reply: &mut Number) -> Result<(), String> {
        reply.value = args
            .value
            .checked_mul(2)
            .ok_or_else(|| "integer overflow".to_string())?;
        Ok(())
    }

    pub fn add(&self, args: Operands, reply: &mut Number) -> Result<(), String> {
        reply.value = args
            .a
            .checked_add(args.b)
            .ok_or_else(|| "integer overflow".to_string())?;
        Ok(())
    }

    pub fn divide(&self, args: Operands, reply: &mut Quotient) -> Result<(), String> {
        if args.b == 0 {
            return Err("divide by zero".to_string());
        }
        reply.quotient = args
            .a
            .checked_div(args.b)
            .ok_or_else(|| "integer overflow".to_string())?;
        reply.remainder = args.a % args.b;
        Ok(())
    }
}

impl Service for Arith {
    fn methods<C: Codec>(set: &mut MethodSet<Self, C>) {
        set.method("Double", Arith::double)
            .method("Add", Arith::add)
            .method("Divide", Arith::divide);
    }
}
