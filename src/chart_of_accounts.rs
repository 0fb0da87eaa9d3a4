use crate::error::{ModelError, Result};
use crate::schema::{Account, AccountId, KeyAccount};
use std::collections::{BTreeMap, HashMap};

/// Lookup index over a model's accounts: by id, by parent, and by key classification.
///
/// Built once per operation from an account slice; iteration orders follow the
/// slice so results are reproducible for identical input.
#[derive(Debug, Clone)]
pub struct ChartOfAccounts<'a> {
    accounts: &'a [Account],
    by_id: HashMap<&'a AccountId, &'a Account>,
    children: HashMap<&'a AccountId, Vec<&'a Account>>,
    key_accounts: BTreeMap<KeyAccount, &'a Account>,
}

impl<'a> ChartOfAccounts<'a> {
    pub fn new(accounts: &'a [Account]) -> Self {
        let mut by_id = HashMap::with_capacity(accounts.len());
        let mut children: HashMap<&AccountId, Vec<&Account>> = HashMap::new();
        let mut key_accounts = BTreeMap::new();

        for account in accounts {
            by_id.entry(&account.id).or_insert(account);

            if let Some(parent_id) = &account.parent_id {
                children.entry(parent_id).or_default().push(account);
            }

            // First classified account wins; the validator reports duplicates.
            if let Some(key) = account.key {
                key_accounts.entry(key).or_insert(account);
            }
        }

        Self {
            accounts,
            by_id,
            children,
            key_accounts,
        }
    }

    pub fn accounts(&self) -> &'a [Account] {
        self.accounts
    }

    pub fn total_accounts(&self) -> usize {
        self.accounts.len()
    }

    pub fn account(&self, id: &AccountId) -> Option<&'a Account> {
        self.by_id.get(id).copied()
    }

    pub fn require(&self, id: &AccountId) -> Result<&'a Account> {
        self.account(id)
            .ok_or_else(|| ModelError::UnknownAccount(id.to_string()))
    }

    pub fn children_of(&self, id: &AccountId) -> &[&'a Account] {
        self.children.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn key_account(&self, key: KeyAccount) -> Option<&'a Account> {
        self.key_accounts.get(&key).copied()
    }

    pub fn require_key_account(&self, key: KeyAccount) -> Result<&'a Account> {
        self.key_account(key).ok_or(ModelError::MissingKeyAccount(key))
    }

    /// True when `ancestor` is `id` itself or one of its parents, transitively.
    pub fn is_within(&self, id: &AccountId, ancestor: &AccountId) -> bool {
        let mut current = Some(id);
        // Parent chains are bounded by the account count, even if malformed.
        for _ in 0..=self.accounts.len() {
            match current {
                Some(cur) if cur == ancestor => return true,
                Some(cur) => current = self.account(cur).and_then(|a| a.parent_id.as_ref()),
                None => return false,
            }
        }
        false
    }

    /// The classified cash total and everything below it.
    pub fn is_cash_account(&self, id: &AccountId) -> bool {
        self.key_account(KeyAccount::CashTotal)
            .map(|cash| self.is_within(id, &cash.id))
            .unwrap_or(false)
    }

    pub fn base_profit_accounts(&self) -> impl Iterator<Item = &'a Account> + '_ {
        self.accounts.iter().filter(|a| a.base_profit)
    }

    pub fn cf_adjustment_accounts(&self) -> impl Iterator<Item = &'a Account> + '_ {
        self.accounts.iter().filter(|a| a.cf_adjustment.is_some())
    }

    /// Flow accounts whose CF adjustment targets `target`.
    pub fn adjustments_targeting(&self, target: &AccountId) -> impl Iterator<Item = &'a Account> + '_ {
        let target = target.clone();
        self.accounts.iter().filter(move |a| {
            a.cf_adjustment
                .as_ref()
                .map(|adj| adj.target_account_id == target)
                .unwrap_or(false)
        })
    }

    /// Stock accounts flagged to feed their period delta into the cash change,
    /// excluding the cash accounts themselves.
    pub fn cf_delta_accounts(&self) -> impl Iterator<Item = &'a Account> + '_ {
        self.accounts
            .iter()
            .filter(move |a| a.generates_cf_item && a.is_stock() && !self.is_cash_account(&a.id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{Aggregation, CfCategory, Operation};

    fn accounts() -> Vec<Account> {
        vec![
            Account::stock("cash", "Cash Total", false)
                .with_aggregation(Aggregation::ChildrenSum)
                .with_key(KeyAccount::CashTotal),
            Account::stock("bank", "Bank", false).with_parent("cash").generating_cf_item(),
            Account::stock("ar", "Receivables", false).generating_cf_item(),
            Account::stock("ppe", "PPE", false),
            Account::flow("dep", "Depreciation").with_cf_adjustment(
                "ppe",
                Operation::Sub,
                CfCategory::Operating,
            ),
            Account::flow("np", "Net Profit").as_base_profit(),
        ]
    }

    #[test]
    fn test_chart_of_accounts_creation() {
        let accounts = accounts();
        let chart = ChartOfAccounts::new(&accounts);

        assert_eq!(chart.total_accounts(), 6);
        assert_eq!(chart.children_of(&AccountId::from("cash")).len(), 1);
        assert!(chart.children_of(&AccountId::from("ar")).is_empty());
        assert_eq!(
            chart.key_account(KeyAccount::CashTotal).unwrap().name,
            "Cash Total"
        );
        assert!(matches!(
            chart.require_key_account(KeyAccount::OperatingProfit),
            Err(ModelError::MissingKeyAccount(KeyAccount::OperatingProfit))
        ));
    }

    #[test]
    fn test_cash_accounts_excluded_from_deltas() {
        let accounts = accounts();
        let chart = ChartOfAccounts::new(&accounts);

        assert!(chart.is_cash_account(&AccountId::from("bank")));
        assert!(!chart.is_cash_account(&AccountId::from("ar")));

        let deltas: Vec<&str> = chart.cf_delta_accounts().map(|a| a.id.as_str()).collect();
        assert_eq!(deltas, vec!["ar"]);
    }

    #[test]
    fn test_relation_lookups() {
        let accounts = accounts();
        let chart = ChartOfAccounts::new(&accounts);

        let adjusters: Vec<&str> = chart
            .adjustments_targeting(&AccountId::from("ppe"))
            .map(|a| a.id.as_str())
            .collect();
        assert_eq!(adjusters, vec!["dep"]);
        assert_eq!(chart.base_profit_accounts().count(), 1);
        assert_eq!(chart.cf_adjustment_accounts().count(), 1);
    }

    #[test]
    fn test_is_within_survives_parent_cycle() {
        let accounts = vec![
            Account::flow("a", "A").with_parent("b"),
            Account::flow("b", "B").with_parent("a"),
        ];
        let chart = ChartOfAccounts::new(&accounts);
        assert!(!chart.is_within(&AccountId::from("a"), &AccountId::from("zzz")));
        assert!(chart.is_within(&AccountId::from("a"), &AccountId::from("b")));
    }
}
