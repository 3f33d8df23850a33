//! Callback payloads, keyboards, and input validation for the conversation.

use coursebot_core::domain::Course;
use coursebot_core::message::Button;
use regex::Regex;
use std::sync::LazyLock;

/// A decoded button press.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Callback {
    FutureCourses,
    PastCourses,
    ClientCourses,
    SearchUs,
    AdminMsg,
    Menu,
    Enroll(i64),
    CancelEnrollment(i64),
    /// Course details; `back` is the callback of the list it was opened from.
    CourseInfo { id: i64, back: String },
    PhoneConfirmed,
    PhoneRejected,
}

impl Callback {
    pub fn parse(data: &str) -> Option<Self> {
        let data = data.trim();
        match data {
            "future_courses" => return Some(Self::FutureCourses),
            "past_courses" => return Some(Self::PastCourses),
            "client_courses" => return Some(Self::ClientCourses),
            "search_us" => return Some(Self::SearchUs),
            "admin_msg" => return Some(Self::AdminMsg),
            "menu" => return Some(Self::Menu),
            "phone_true" => return Some(Self::PhoneConfirmed),
            "phone_false" => return Some(Self::PhoneRejected),
            _ => {}
        }
        if let Some(rest) = data.strip_prefix("en_") {
            return match rest.strip_suffix("_c") {
                Some(id) => id.parse().ok().map(Self::CancelEnrollment),
                None => rest.parse().ok().map(Self::Enroll),
            };
        }
        let (id, back) = data.strip_prefix("c:")?.split_once(':')?;
        Some(Self::CourseInfo {
            id: id.parse().ok()?,
            back: back.to_string(),
        })
    }

    pub fn data(&self) -> String {
        match self {
            Self::FutureCourses => "future_courses".into(),
            Self::PastCourses => "past_courses".into(),
            Self::ClientCourses => "client_courses".into(),
            Self::SearchUs => "search_us".into(),
            Self::AdminMsg => "admin_msg".into(),
            Self::Menu => "menu".into(),
            Self::Enroll(id) => format!("en_{id}"),
            Self::CancelEnrollment(id) => format!("en_{id}_c"),
            Self::CourseInfo { id, back } => format!("c:{id}:{back}"),
            Self::PhoneConfirmed => "phone_true".into(),
            Self::PhoneRejected => "phone_false".into(),
        }
    }

    fn button(self, label: &str) -> Button {
        Button::new(label, self.data())
    }
}

static PHONE_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\+7|7|8)?[\s\-]?\(?[489][0-9]{2}\)?[\s\-]?[0-9]{3}[\s\-]?[0-9]{2}[\s\-]?[0-9]{2}$")
        .expect("invalid phone regex")
});

/// Validate a Russian mobile number and normalise it to `+7XXXXXXXXXX`.
pub fn normalize_phone(input: &str) -> Option<String> {
    let input = input.trim();
    if !PHONE_PATTERN.is_match(input) {
        return None;
    }
    let digits: String = input.chars().filter(char::is_ascii_digit).collect();
    let national = &digits[digits.len().checked_sub(10)?..];
    Some(format!("+7{national}"))
}

pub fn main_menu() -> Vec<Vec<Button>> {
    vec![
        vec![Callback::FutureCourses.button("Upcoming courses")],
        vec![Callback::PastCourses.button("Past courses")],
        vec![Callback::ClientCourses.button("My courses")],
        vec![Callback::SearchUs.button("How to find us")],
        vec![Callback::AdminMsg.button("Write to the administrator")],
    ]
}

/// One button per course, then a way back to the menu.
pub fn course_list(courses: &[Course], back: &Callback, start: impl Fn(&Course) -> String) -> Vec<Vec<Button>> {
    let back = back.data();
    let mut rows: Vec<Vec<Button>> = courses
        .iter()
        .map(|course| {
            vec![Callback::CourseInfo {
                id: course.id,
                back: back.clone(),
            }
            .button(&format!("{} · {}", course.name, start(course)))]
        })
        .collect();
    rows.push(vec![Callback::Menu.button("Back to menu")]);
    rows
}

/// Buttons under a course description.
pub fn course_actions(course_id: i64, open: bool, enrolled: bool, back: &str) -> Vec<Vec<Button>> {
    let mut rows = Vec::new();
    if open {
        rows.push(vec![if enrolled {
            Callback::CancelEnrollment(course_id).button("Cancel enrollment")
        } else {
            Callback::Enroll(course_id).button("Enroll")
        }]);
    }
    rows.push(vec![Button::new("Back", back)]);
    rows
}

pub fn confirm_phone() -> Vec<Vec<Button>> {
    vec![vec![
        Callback::PhoneConfirmed.button("Yes"),
        Callback::PhoneRejected.button("Use another number"),
    ]]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_menu_callbacks() {
        assert_eq!(Callback::parse("future_courses"), Some(Callback::FutureCourses));
        assert_eq!(Callback::parse("admin_msg"), Some(Callback::AdminMsg));
        assert_eq!(Callback::parse("phone_false"), Some(Callback::PhoneRejected));
        assert_eq!(Callback::parse("something_else"), None);
    }

    #[test]
    fn test_parse_enrollment_callbacks() {
        assert_eq!(Callback::parse("en_12"), Some(Callback::Enroll(12)));
        assert_eq!(Callback::parse("en_12_c"), Some(Callback::CancelEnrollment(12)));
        assert_eq!(Callback::parse("en_x"), None);
    }

    #[test]
    fn test_parse_course_info_keeps_back_target() {
        assert_eq!(
            Callback::parse("c:7:past_courses"),
            Some(Callback::CourseInfo {
                id: 7,
                back: "past_courses".into()
            })
        );
        assert_eq!(Callback::parse("c:7"), None);
        assert_eq!(Callback::parse("c:seven:menu"), None);
    }

    #[test]
    fn test_normalize_phone_variants() {
        for input in [
            "+7 912 345-67-89",
            "89123456789",
            "8 (912) 345 67 89",
            "9123456789",
            "7-912-345-67-89",
        ] {
            assert_eq!(normalize_phone(input).as_deref(), Some("+79123456789"), "{input}");
        }
    }

    #[test]
    fn test_normalize_phone_rejects_garbage() {
        assert_eq!(normalize_phone("hello"), None);
        assert_eq!(normalize_phone("+1 212 555 0100"), None);
        assert_eq!(normalize_phone("8 (112) 345 67 89"), None);
        assert_eq!(normalize_phone("912345678"), None);
    }

    #[test]
    fn test_course_actions_offer_cancel_when_enrolled() {
        let rows = course_actions(3, true, true, "future_courses");
        assert_eq!(rows[0][0].data, "en_3_c");
        assert_eq!(rows[1][0].data, "future_courses");
        let closed = course_actions(3, false, false, "past_courses");
        assert_eq!(closed.len(), 1);
    }
}
