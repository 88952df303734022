use super::events::{LEGACY_DAYS, PRIMARY_DAYS};
use super::{Ledger, SqlFilter};
use crate::{
    bucket::Bucket,
    error::RecoveryResult,
    quartile::{CollectorVolume, VolumeMeasure},
    types::CollectorId,
};
use chrono::NaiveDate;
use rusqlite::params_from_iter;

/// Which collectors and rows count toward ranking volume.
#[derive(Debug, Clone)]
pub struct VolumeScope<'a> {
    pub bucket:           Bucket,
    pub start:            Option<NaiveDate>,
    pub end:              Option<NaiveDate>,
    pub measure:          VolumeMeasure,
    pub agreement_action: &'a str,
    /// Restrict the ranked population to these collectors.
    pub collectors:       Option<&'a [CollectorId]>,
}

impl VolumeScope<'_> {
    fn filter(&self) -> SqlFilter {
        let mut filter = SqlFilter::new()
            .collector_present("collector_id")
            .bucket(self.bucket, PRIMARY_DAYS, LEGACY_DAYS)
            .date_range("event_date", self.start, self.end);
        if !matches!(self.measure, VolumeMeasure::Attempts) {
            filter = filter.text_eq("action_code", self.agreement_action);
        }
        if let Some(ids) = self.collectors {
            filter = filter.text_in("collector_id", ids);
        }
        filter
    }

    fn volume_sql(&self) -> &'static str {
        match self.measure {
            VolumeMeasure::Attempts | VolumeMeasure::Agreements => "CAST(COUNT(*) AS REAL)",
            VolumeMeasure::AgreementValue => "COALESCE(SUM(CASE WHEN amount > 0 THEN amount END), 0.0)",
        }
    }
}

impl Ledger {
    /// Collector volumes over the scope, ranked by volume descending with
    /// collector id as the stable tiebreak.
    pub fn collector_volumes(&self, scope: &VolumeScope<'_>) -> RecoveryResult<Vec<CollectorVolume>> {
        let filter = scope.filter();
        let sql = format!(
            "SELECT collector_id, {volume} AS volume
             FROM collection_event{where_sql}
             GROUP BY collector_id
             ORDER BY volume DESC, collector_id ASC",
            volume = scope.volume_sql(),
            where_sql = filter.where_sql(),
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params_from_iter(filter.params()), |row| {
                Ok(CollectorVolume {
                    collector_id: row.get(0)?,
                    volume:       row.get(1)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Per-day collector volumes, each day's list ranked the same way as
    /// [`collector_volumes`](Ledger::collector_volumes).
    pub fn collector_volumes_by_day(
        &self,
        scope: &VolumeScope<'_>,
    ) -> RecoveryResult<Vec<(NaiveDate, Vec<CollectorVolume>)>> {
        let filter = scope.filter();
        let sql = format!(
            "SELECT event_date, collector_id, {volume} AS volume
             FROM collection_event{where_sql}
             GROUP BY event_date, collector_id
             ORDER BY event_date ASC, volume DESC, collector_id ASC",
            volume = scope.volume_sql(),
            where_sql = filter.where_sql(),
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params_from_iter(filter.params()), |row| {
                Ok((
                    row.get::<_, NaiveDate>(0)?,
                    CollectorVolume {
                        collector_id: row.get(1)?,
                        volume:       row.get(2)?,
                    },
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut days: Vec<(NaiveDate, Vec<CollectorVolume>)> = Vec::new();
        for (day, volume) in rows {
            match days.last_mut() {
                Some((current, list)) if *current == day => list.push(volume),
                _ => days.push((day, vec![volume])),
            }
        }
        Ok(days)
    }
}
