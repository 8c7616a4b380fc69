use std::collections::BTreeSet;

/// Section labels the history page uses for plays from the current day.
const TODAY_LABELS: &[(&str, &str)] = &[
    ("Today", "en"),
    ("Hoy", "es"),
    ("Hoje", "pt"),
    ("Oggi", "it"),
    ("Aujourd'hui", "fr"),
    ("Aujourd\u{2019}hui", "fr"),
    ("Heute", "de"),
    ("Vandaag", "nl"),
    ("Idag", "sv"),
    ("I dag", "no"),
    ("Tänään", "fi"),
    ("Täna", "et"),
    ("Šodien", "lv"),
    ("Šiandien", "lt"),
    ("Dzisiaj", "pl"),
    ("Dnes", "cs"),
    ("Danes", "sl"),
    ("Astăzi", "ro"),
    ("Azi", "ro"),
    ("Ma", "hu"),
    ("Bugün", "tr"),
    ("Σήμερα", "el"),
    ("Днес", "bg"),
    ("Данас", "sr"),
    ("Danas", "hr"),
    ("Денес", "mk"),
    ("Данеска", "mk"),
    ("Avui", "ca"),
    ("Hoxe", "gl"),
    ("Gaur", "eu"),
    ("Í dag", "is"),
    ("Sot", "sq"),
    ("Heddiw", "cy"),
    ("Inniu", "ga"),
    ("Illum", "mt"),
    ("Сегодня", "ru"),
    ("Сьогодні", "uk"),
    ("Сёння", "be"),
    ("Бүгін", "kk"),
    ("Бүгүн", "ky"),
    ("Bugun", "uz"),
    ("Bu gün", "az"),
    ("Өнөөдөр", "mn"),
    ("اليوم", "ar"),
    ("امروز", "fa"),
    ("آج", "ur"),
    ("今天", "zh"),
    ("今日", "ja"),
    ("오늘", "ko"),
    ("आज", "hi"),
    ("আজ", "bn"),
    ("આજે", "gu"),
    ("இன்று", "ta"),
    ("ఈ రోజు", "te"),
    ("ಇಂದು", "kn"),
    ("ഇന്ന്", "ml"),
    ("ਅੱਜ", "pa"),
    ("අද", "si"),
    ("วันนี้", "th"),
    ("Hôm nay", "vi"),
    ("Hari ini", "id"),
    ("Ngayong araw", "tl"),
    ("Ngayon", "tl"),
    ("ယနေ့", "my"),
    ("ថ្ងៃនេះ", "km"),
    ("ມື້ນີ້", "lo"),
    ("Leo", "sw"),
    ("Vandag", "af"),
    ("Namuhla", "zu"),
    ("ዛሬ", "am"),
    ("היום", "he"),
    ("დღეს", "ka"),
    ("Այսօր", "hy"),
];

const YESTERDAY_LABELS: &[(&str, &str)] = &[
    ("Yesterday", "en"),
    ("Ayer", "es"),
    ("Ontem", "pt"),
    ("Ieri", "it"),
    ("Hier", "fr"),
    ("Gestern", "de"),
    ("Gisteren", "nl"),
    ("Igår", "sv"),
    ("I går", "no"),
    ("Eilen", "fi"),
    ("Eile", "et"),
    ("Vakar", "lv"),
    ("Vakar", "lt"),
    ("Wczoraj", "pl"),
    ("Včera", "cs"),
    ("Včeraj", "sl"),
    ("Ieri", "ro"),
    ("Tegnap", "hu"),
    ("Dün", "tr"),
    ("Χθες", "el"),
    ("Вчера", "bg"),
    ("Јуче", "sr"),
    ("Jučer", "hr"),
    ("Вчера", "ru"),
    ("Вчора", "uk"),
    ("Учора", "be"),
    ("Ahir", "ca"),
    ("Onte", "gl"),
    ("Atzo", "eu"),
    ("أمس", "ar"),
    ("دیروز", "fa"),
    ("کل", "ur"),
    ("昨天", "zh"),
    ("昨日", "ja"),
    ("어제", "ko"),
    ("कल", "hi"),
    ("গতকাল", "bn"),
    ("ગઈકાલે", "gu"),
    ("நேற்று", "ta"),
    ("నిన్న", "te"),
    ("ನಿನ್ನೆ", "kn"),
    ("ഇന്നലെ", "ml"),
    ("ਕੱਲ੍ਹ", "pa"),
    ("เมื่อวาน", "th"),
    ("Hôm qua", "vi"),
    ("Kemarin", "id"),
    ("Semalam", "ms"),
    ("Kahapon", "tl"),
    ("မနေ့က", "my"),
    ("Jana", "sw"),
    ("Gister", "af"),
    ("אתמול", "he"),
    ("გუშინ", "ka"),
    ("Երեկ", "hy"),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DateLabel {
    Today(&'static str),
    Yesterday(&'static str),
    Unknown,
}

pub fn detect(label: &str) -> DateLabel {
    let cleaned = label.trim();
    if cleaned.is_empty() {
        return DateLabel::Unknown;
    }
    if let Some(lang) = lookup(TODAY_LABELS, cleaned) {
        return DateLabel::Today(lang);
    }
    if let Some(lang) = lookup(YESTERDAY_LABELS, cleaned) {
        return DateLabel::Yesterday(lang);
    }
    DateLabel::Unknown
}

pub fn is_today(label: &str) -> bool {
    matches!(detect(label), DateLabel::Today(_))
}

/// Labels that are neither today nor yesterday, in first-seen order
/// without duplicates. Typically weekday names or dates, logged so new
/// locales can be added.
pub fn unknown_labels<'a>(labels: impl IntoIterator<Item = &'a str>) -> Vec<String> {
    let mut seen = BTreeSet::new();
    let mut unknown = Vec::new();
    for label in labels {
        let cleaned = label.trim();
        if cleaned.is_empty() || detect(cleaned) != DateLabel::Unknown {
            continue;
        }
        if seen.insert(cleaned.to_string()) {
            unknown.push(cleaned.to_string());
        }
    }
    unknown
}

pub fn today_languages<'a>(labels: impl IntoIterator<Item = &'a str>) -> BTreeSet<&'static str> {
    labels
        .into_iter()
        .filter_map(|label| match detect(label) {
            DateLabel::Today(lang) => Some(lang),
            _ => None,
        })
        .collect()
}

fn lookup(table: &[(&str, &'static str)], cleaned: &str) -> Option<&'static str> {
    let lowered = cleaned.to_lowercase();
    table
        .iter()
        .find(|(token, _)| token.to_lowercase() == lowered)
        .map(|(_, lang)| *lang)
}
