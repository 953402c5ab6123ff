use tracing::{debug, info};

use crate::Result;
use crate::kernel::NetNs;
use crate::netiputil::Family;

/// iptables or ip6tables, depending on the family.
#[derive(Clone, Copy, Debug)]
pub struct Iptables {
    family: Family,
}

impl Iptables {
    pub fn new(family: Family) -> Self {
        Self { family }
    }

    fn program(&self) -> &'static str {
        match self.family {
            Family::V4 => "iptables",
            Family::V6 => "ip6tables",
        }
    }

    fn args(op: &str, table: &str, chain: &str, pos: Option<u32>, rule: &[String]) -> Vec<String> {
        let mut args = vec![
            "-w".to_owned(),
            "-t".to_owned(),
            table.to_owned(),
            op.to_owned(),
            chain.to_owned(),
        ];
        if let Some(pos) = pos {
            args.push(pos.to_string());
        }
        args.extend(rule.iter().cloned());
        args
    }

    pub async fn exists(&self, ns: &NetNs, table: &str, chain: &str, rule: &[String]) -> Result<bool> {
        ns.test(self.program(), &Self::args("-C", table, chain, None, rule))
            .await
    }

    /// Inserts `rule` at `pos` unless it is already somewhere in the chain.
    pub async fn insert_unique(
        &self,
        ns: &NetNs,
        table: &str,
        chain: &str,
        pos: u32,
        rule: &[String],
    ) -> Result<()> {
        if self.exists(ns, table, chain, rule).await? {
            debug!("{} rule already present in {table}/{chain}", self.family);
            return Ok(());
        }
        ns.exec(self.program(), &Self::args("-I", table, chain, Some(pos), rule))
            .await?;
        info!("inserted {} rule into {table}/{chain}: {}", self.family, rule.join(" "));
        Ok(())
    }

    /// Appends `rule` unless it is already somewhere in the chain.
    pub async fn append_unique(
        &self,
        ns: &NetNs,
        table: &str,
        chain: &str,
        rule: &[String],
    ) -> Result<()> {
        if self.exists(ns, table, chain, rule).await? {
            debug!("{} rule already present in {table}/{chain}", self.family);
            return Ok(());
        }
        ns.exec(self.program(), &Self::args("-A", table, chain, None, rule))
            .await?;
        info!("appended {} rule to {table}/{chain}: {}", self.family, rule.join(" "));
        Ok(())
    }
}
