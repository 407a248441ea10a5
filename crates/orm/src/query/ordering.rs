//! Order shorthand
//!
//! Order is given as a flat token list: a column name, optionally followed by
//! `"A"` (ascending) or `"Z"` (descending). A leading `-` on a column name is
//! the same as following it with `"Z"`.

use crate::backends::{OrderBy, OrderDirection};

/// Turn order tokens into [`OrderBy`] entries.
pub fn standardize_order<S: AsRef<str>>(tokens: &[S]) -> Vec<OrderBy> {
    let mut order: Vec<OrderBy> = Vec::new();

    for token in tokens {
        let token = token.as_ref().trim();
        match token {
            "" => {}
            "A" | "Z" => {
                if let Some(last) = order.last_mut() {
                    last.direction = if token == "Z" {
                        OrderDirection::Desc
                    } else {
                        OrderDirection::Asc
                    };
                }
            }
            _ => match token.strip_prefix('-') {
                Some(column) => order.push(OrderBy::desc(column)),
                None => order.push(OrderBy::asc(token)),
            },
        }
    }

    order
}
