//! Line-oriented dump of the shared state, for diagnostics.
//!
//! The format is stable enough to grep but is not a machine interface;
//! use [`crate::table::StateSnapshot`] for programmatic access.

use crate::caps::ResClass;
use crate::layout::{ControlRegion, CONTROL_VERSION, MAX_PENDING};
use crate::pool;
use std::io::{self, Write};

pub(crate) fn write_state<W: Write>(region: &ControlRegion, out: &mut W) -> io::Result<()> {
    let header = region.header();
    writeln!(
        out,
        "control file v{} revision {} crc {:#010x} next-request {}",
        CONTROL_VERSION,
        header.revision(),
        header.crc(),
        header.peek_next_request_id(),
    )?;
    writeln!(
        out,
        "policy requester-wins-tie={}",
        header.requester_wins_tie()
    )?;

    for class in ResClass::ALL {
        let section = region.class(class);
        let in_use = MAX_PENDING - pool::free_count(section);
        writeln!(
            out,
            "class {} criteria={:#x} slots={} pending={}/{}",
            class,
            section.criteria_raw(),
            section.slot_count(),
            in_use,
            MAX_PENDING,
        )?;
        for idx in 0..section.slot_count() {
            let rec = section.slot(idx);
            match rec.owner() {
                Some(owner) => writeln!(
                    out,
                    "  slot {} caps={} owner pid={} request={} priority={} usage={:#x}",
                    idx,
                    rec.caps(),
                    owner.pid,
                    owner.request_id,
                    owner.priority,
                    owner.usage,
                )?,
                None => writeln!(out, "  slot {} caps={} free", idx, rec.caps())?,
            }
            for entry in pool::waiters(section, idx) {
                let req = section.entry(entry).load_request();
                writeln!(
                    out,
                    "    waiter request={} pid={} priority={} usage={:#x} entry={}",
                    req.request_id, req.pid, req.priority, req.usage, entry,
                )?;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::{test_region, Owner, QueuedRequest, NONE_INDEX};

    #[test]
    fn test_dump_lists_owners_and_waiters() {
        let region = test_region();
        let section = region.class(ResClass::Video);
        section.slot(0).set_owner(Owner {
            request_id: 7,
            pid: 1234,
            priority: 5,
            usage: 0,
        });
        let entry = pool::acquire(section).unwrap();
        section.entry(entry).store_request(&QueuedRequest {
            request_id: 9,
            class_code: ResClass::Video.index() as u32,
            usage: 0,
            priority: 3,
            max_width: NONE_INDEX,
            max_height: NONE_INDEX,
            pid: 4321,
            target_slot: 0,
            token: 1,
        });
        pool::insert_by_priority(section, 0, entry);

        let mut buf = Vec::new();
        write_state(&region, &mut buf).unwrap();
        let text = String::from_utf8(buf).unwrap();
        assert!(text.contains("policy requester-wins-tie=false"));
        assert!(text.contains("class video"));
        assert!(text.contains("owner pid=1234 request=7 priority=5"));
        assert!(text.contains("waiter request=9 pid=4321 priority=3"));
        assert!(text.contains("class frontend"));
    }

    #[test]
    fn test_dump_of_fresh_region_shows_all_free() {
        let region = test_region();
        let mut buf = Vec::new();
        write_state(&region, &mut buf).unwrap();
        let text = String::from_utf8(buf).unwrap();
        assert!(!text.contains("owner"));
        assert!(!text.contains("waiter"));
        assert!(text.contains("free"));
    }
}
