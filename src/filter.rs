//! Module filter expressions (spec.md Design Note §9): "a small operator
//! algebra... represented as a tagged sum with a pure evaluator; no
//! dynamic dispatch needed." The core never constructs these itself —
//! they arrive pre-compiled from SUPERVISOR as part of `ADD_MODULE` — it
//! only calls `evaluate`.

use crate::packet::Packet;

#[derive(Clone, Debug, PartialEq)]
pub enum Field {
    SourceSniffer,
    WireLen,
    CapLen,
    L2Type,
    L3Type,
    L4Type,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Cmp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Clone, Debug, PartialEq)]
pub enum FilterExpr {
    True,
    False,
    Compare { field: Field, op: Cmp, value: u32 },
    And(Box<FilterExpr>, Box<FilterExpr>),
    Or(Box<FilterExpr>, Box<FilterExpr>),
    Not(Box<FilterExpr>),
}

impl FilterExpr {
    fn field_value(field: &Field, pkt: &Packet) -> u32 {
        match field {
            Field::SourceSniffer => pkt.source as u32,
            Field::WireLen => pkt.wire_len,
            Field::CapLen => pkt.cap_len,
            Field::L2Type => pkt.offsets.l2 as u32,
            Field::L3Type => pkt.offsets.l3 as u32,
            Field::L4Type => pkt.offsets.l4 as u32,
        }
    }

    /// Pure evaluation of the expression tree over one packet. The core
    /// only ever calls this function; it never inspects the tree's shape.
    pub fn evaluate(&self, pkt: &Packet) -> bool {
        match self {
            FilterExpr::True => true,
            FilterExpr::False => false,
            FilterExpr::Compare { field, op, value } => {
                let v = Self::field_value(field, pkt);
                match op {
                    Cmp::Eq => v == *value,
                    Cmp::Ne => v != *value,
                    Cmp::Lt => v < *value,
                    Cmp::Le => v <= *value,
                    Cmp::Gt => v > *value,
                    Cmp::Ge => v >= *value,
                }
            }
            FilterExpr::And(a, b) => a.evaluate(pkt) && b.evaluate(pkt),
            FilterExpr::Or(a, b) => a.evaluate(pkt) || b.evaluate(pkt),
            FilterExpr::Not(a) => !a.evaluate(pkt),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{LayerOffsets, LayerTag};
    use crate::timestamp::Timestamp;

    fn pkt(wire_len: u32) -> Packet<'static> {
        Packet {
            ts: Timestamp::ZERO,
            wire_len,
            cap_len: wire_len,
            source: 0,
            type_tag: LayerTag::empty(),
            dropped_since_last: 0,
            offsets: LayerOffsets::default(),
            payload: &[],
        }
    }

    #[test]
    fn and_short_circuits_correctly() {
        let expr = FilterExpr::And(
            Box::new(FilterExpr::Compare {
                field: Field::WireLen,
                op: Cmp::Ge,
                value: 100,
            }),
            Box::new(FilterExpr::Not(Box::new(FilterExpr::False))),
        );
        assert!(expr.evaluate(&pkt(150)));
        assert!(!expr.evaluate(&pkt(50)));
    }
}
