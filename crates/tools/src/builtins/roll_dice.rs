//! Dice-roll tool: the literal scenario for docstring-derived schema
//! (a single parameter parsed from the `Args:` section, summed result
//! reported as a sentence).

use std::collections::HashMap;

use anyhow::{bail, Result};
use async_trait::async_trait;
use rand::Rng;

use crate::{Tool, ToolOutput, ToolSpec};

const DOCSTRING: &str = "Roll dice and report the sum.\n\nArgs:\n    dice_str: Dice expression like 2d6";

pub struct RollDiceTool;

#[async_trait]
impl Tool for RollDiceTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec::from_docstring("roll_dice", DOCSTRING)
    }

    async fn run(&self, args: &HashMap<String, String>) -> Result<ToolOutput> {
        let dice_str = args
            .get("dice_str")
            .ok_or_else(|| anyhow::anyhow!("missing required param: dice_str"))?;
        let (count, sides) = parse_dice_expr(dice_str)?;

        let mut rng = rand::thread_rng();
        let total: i64 = (0..count).map(|_| rng.gen_range(1..=sides)).sum();

        Ok(ToolOutput {
            success: true,
            output: format!("The result of rolling {dice_str} is {total}."),
        })
    }
}

fn parse_dice_expr(expr: &str) -> Result<(u32, u32)> {
    let (count_str, sides_str) = expr
        .split_once('d')
        .ok_or_else(|| anyhow::anyhow!("dice expression must look like '2d6'"))?;
    let count: u32 = count_str.trim().parse()?;
    let sides: u32 = sides_str.trim().parse()?;
    if count == 0 || sides == 0 {
        bail!("dice count and sides must both be positive");
    }
    Ok((count, sides))
}
